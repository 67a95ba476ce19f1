//! Print a fresh room code.

use drop_types::SessionCode;

/// Run the code command.
pub fn run(length: usize) {
    println!("{}", SessionCode::generate(length));
}
