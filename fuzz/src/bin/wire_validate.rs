#[macro_use]
extern crate afl;

use ciphermesh::wire;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(raw) = std::str::from_utf8(data) {
            let _ = wire::validate(raw);
        }
    });
}
