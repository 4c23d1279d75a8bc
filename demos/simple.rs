use nalgebra::dmatrix;

use lib_autovar::matrix::{Tape, TapeExt};

fn main() -> lib_autovar::Result<()> {
  let mut tape = Tape::new();

  let a = tape.var_from(dmatrix![1.0, 2.0; 3.0, 4.0]);
  let b = tape.var_from(dmatrix![0.5, -1.0; 2.0, 0.0]);

  // f(a, b) = sin(a·b) + a∘a
  let ab = tape.matmul(a, b)?;
  let s = tape.sin(ab)?;
  let sq = tape.hadamard(a, a)?;
  let f = tape.add(s, sq)?;

  tape.backward(f)?;

  println!("f     = {}", tape.dense(f)?);
  println!("df/da = {}", tape.grad(a)?);
  println!("df/db = {}", tape.grad(b)?);
  Ok(())
}
