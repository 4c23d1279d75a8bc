use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lib_autovar::matrix::{Matrix, Tape, TapeExt};

/// Pull the embeddings of a few tokens towards fixed targets
fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let vocab = 6;
  let dim = 3;
  let tokens = [4, 1, 4, 0];

  let mut rng = StdRng::seed_from_u64(7);
  let mut tape = Tape::new();

  let table = tape.var(vocab, dim);
  tape.randoms(table, 0.0, 0.1, &mut rng)?;
  let ids = tape.sparse_var(&tokens, vocab)?;
  let target = tape.var_from(Matrix::from_fn(tokens.len(), dim, |i, _| tokens[i] as f32));
  tape.set_tracks_gradient(target, false)?;
  let ones = tape.var_from(Matrix::from_element(1, tokens.len(), 1.0));
  tape.set_tracks_gradient(ones, false)?;
  let reduce = tape.var_from(Matrix::from_element(dim, 1, 1.0));
  tape.set_tracks_gradient(reduce, false)?;

  for step in 0..200 {
    let looked_up = tape.embed(ids, table)?;
    let err = tape.sub(looked_up, target)?;
    let sq = tape.hadamard(err, err)?;
    let rows = tape.matmul(ones, sq)?;
    let loss = tape.matmul(rows, reduce)?;

    tape.zero_grad(table)?;
    tape.backward(loss)?;
    let update = tape.grad(table)? * 0.05;
    *tape.dense_mut(table)? -= update;

    if step % 50 == 0 {
      info!(step, loss = tape.value(loss)?, "embedding");
    }
    tape.release_graph(loss)?;
  }

  println!("table = {}", tape.dense(table)?);
  Ok(())
}
