use serde::{Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

// Helpers for serde to parse fields with quirks.

/// Parse the survival months column.
///
/// The registry writes "Unknown" (and occasionally nothing) where follow-up
/// is missing; any value that doesn't parse as a number is coerced to `None`
/// rather than failing the import.
pub fn survival_months<'de, D>(d: D) -> Result<Option<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("unknown") {
        return Ok(None);
    }
    Ok(s.parse::<f32>().ok())
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}
