use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;
use tracing_subscriber::EnvFilter;

use lib_autovar::matrix::{Matrix, Tape, TapeExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let x1_data = [1.0, 2.0, 3.0, 4.0, 5.0];
  let x2_data = [2.0, 1.0, 0.0, -1.0, 2.0];
  let n = x1_data.len();

  // y = 5.4*x1 - 2.3*x2 - 1.4, the bias rides on a constant third column
  let features = Matrix::from_fn(n, 3, |i, j| match j {
    0 => x1_data[i],
    1 => x2_data[i],
    _ => 1.0,
  });
  let targets = Matrix::from_fn(n, 1, |i, _| 5.4 * x1_data[i] - 2.3 * x2_data[i] - 1.4);

  let learning_rate = 0.02;
  let epochs = 20_000;

  let file = File::create("training_loss.csv")?;
  let mut buf = BufWriter::new(file);
  writeln!(buf, "epoch,loss")?;

  let mut tape = Tape::new();
  let x = tape.var_from(features);
  let y = tape.var_from(targets);
  let ones = tape.var_from(Matrix::from_element(1, n, 1.0));
  for constant in [x, y, ones] {
    tape.set_tracks_gradient(constant, false)?;
  }
  let w = tape.var(3, 1);
  tape.set_name(w, "weights")?;

  for epoch in 0..epochs {
    let pred = tape.matmul(x, w)?;
    let err = tape.sub(pred, y)?;
    let sq = tape.hadamard(err, err)?;
    let total = tape.matmul(ones, sq)?;
    let mse = tape.mul_scalar(total, 1.0 / n as f32)?;

    tape.zero_grad(w)?;
    tape.backward(mse)?;
    let step = tape.grad(w)? * learning_rate;
    *tape.dense_mut(w)? -= step;

    let loss = tape.value(mse)?;
    if epoch % 1000 == 0 {
      info!(epoch, loss, "training");
    }
    writeln!(buf, "{epoch},{loss}")?;

    // every intermediate goes back to the pool for the next epoch
    tape.release_graph(mse)?;
  }

  let w = tape.dense(w)?;
  println!("trained parameters:");
  println!("w1 = {:.4}", w[0]);
  println!("w2 = {:.4}", w[1]);
  println!("b  = {:.4}", w[2]);
  println!("pool: {:?}", tape.pool().stats());

  buf.flush()?;
  Ok(())
}
