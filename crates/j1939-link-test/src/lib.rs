//! Test-only helpers shared by `j1939-link` and `j1939-node`'s integration tests.

use std::process::Output;

pub use assert_cmd::Command;
use eyre::WrapErr;
use j1939_link::CanFrame;

pub trait CommandExt {
    /// Same as [Command::output] except with hooks to print stdout/stderr in failed tests
    fn captured_output(&mut self) -> std::io::Result<Output>;
}

impl CommandExt for Command {
    fn captured_output(&mut self) -> std::io::Result<Output> {
        let output = self.output()?;

        // libtest injects magic in print! macros to capture output in tests
        print!("{}", String::from_utf8_lossy(&output.stdout));
        eprint!("{}", String::from_utf8_lossy(&output.stderr));

        Ok(output)
    }
}

/// Get a temporary file with the given contents
pub fn tempfile<S: AsRef<str>>(contents: S) -> eyre::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut file, contents.as_ref().as_bytes())?;
    Ok(file)
}

/// Get a command to run the given tool binary.
///
/// Uses `CARGO_BIN_EXE_<name>` which cargo sets at compile time for
/// integration tests in the same crate as the binary.
#[macro_export]
macro_rules! tool {
    ($name:literal) => {{
        let mut cmd = $crate::Command::new(env!(concat!("CARGO_BIN_EXE_", $name)));
        cmd
    }};
}

/// Parse a candump-file-format (`candump -L`) fixture into [CanFrame]s, e.g.
///
/// ```text
/// (0) can0 18EEFF40#0102030405060708
/// (1) can0 18EEFF41#0807060504030201
/// ```
///
/// Timestamp and interface columns are accepted (to keep fixtures copy-pasteable from a real
/// candump capture) but discarded: only the canid/data fields become the [CanFrame].
pub fn parse_candump_fixture(text: &str) -> eyre::Result<Vec<CanFrame>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_fixture_line)
        .collect()
}

fn parse_fixture_line(line: &str) -> eyre::Result<CanFrame> {
    let frame_field = line
        .split_ascii_whitespace()
        .last()
        .ok_or_else(|| eyre::eyre!("empty fixture line"))?;
    let (id_hex, data_hex) = frame_field
        .split_once('#')
        .ok_or_else(|| eyre::eyre!("fixture line {line:?} missing '#' separator"))?;
    let id = u32::from_str_radix(id_hex, 16).wrap_err("failed to parse canid")?;
    if data_hex.len() > 16 || data_hex.len() % 2 != 0 {
        eyre::bail!("fixture line {line:?} has malformed data field {data_hex:?}");
    }
    let mut data = Vec::with_capacity(data_hex.len() / 2);
    for i in (0..data_hex.len()).step_by(2) {
        data.push(u8::from_str_radix(&data_hex[i..i + 2], 16).wrap_err("failed to parse byte")?);
    }
    Ok(CanFrame::new(id, &data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixture_with_timestamp_and_interface() {
        let text = "(0.000000) can0 18EEFF40#0102030405060708\n\
                     (0.010000) can0 18EEFF41#0807060504030201\n";
        let frames = parse_candump_fixture(text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x18EEFF40);
        assert_eq!(frames[0].data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frames[1].id, 0x18EEFF41);
    }

    #[test]
    fn test_parse_fixture_bare_frames() {
        let text = "18EEFF40#0A0B\n";
        let frames = parse_candump_fixture(text).unwrap();
        assert_eq!(frames[0].data(), &[0x0A, 0x0B]);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let text = "18EEFF40#0A\n\n   \n18EEFF41#0B\n";
        let frames = parse_candump_fixture(text).unwrap();
        assert_eq!(frames.len(), 2);
    }
}
