//! Flat text model files.
//!
//! ```text
//! J1234+5678          name
//! 1400.0              reference frequency [MHz]
//! 0.0                 DC
//! loc m_loc wid m_wid amp alpha     one line per component
//! ```
use crate::error::PortraitError;
use crate::models::gaussian::{GaussianComponent, GaussianModel, PORTRAIT_STRIDE};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

type Result<T> = std::result::Result<T, PortraitError>;

fn parse_float(token: &str, what: &str, line_number: usize) -> Result<f64> {
    token.parse::<f64>().map_err(|_| {
        PortraitError::MalformedModelFile(format!("Unable to read {what} from line {line_number}: {token:?}"))
    })
}

/// Reads a model from any line source.
///
/// # Errors
/// Will return `Err` if the header is incomplete or any component line does
/// not hold exactly six floats.
pub fn parse_model<R: BufRead>(reader: R) -> Result<GaussianModel> {
    let mut lines = vec![];
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    if lines.len() < 3 {
        return Err(PortraitError::MalformedModelFile(format!(
            "Expected name, reference frequency and DC lines, found {} lines",
            lines.len()
        )));
    }
    let name = lines[0].trim();
    let nu_ref = parse_float(lines[1].trim(), "reference frequency", 2)?;
    let dc = parse_float(lines[2].trim(), "DC", 3)?;

    let mut model = GaussianModel::new(name, nu_ref, dc);
    for (i, line) in lines.iter().enumerate().skip(3) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != PORTRAIT_STRIDE {
            return Err(PortraitError::MalformedModelFile(format!(
                "Line {} has {} fields, expected {}",
                i + 1,
                fields.len(),
                PORTRAIT_STRIDE
            )));
        }
        let mut block = [0.0; PORTRAIT_STRIDE];
        for (value, token) in block.iter_mut().zip(fields) {
            *value = parse_float(token, "component", i + 1)?;
        }
        model.components.push(GaussianComponent::from_slice(&block));
    }
    Ok(model)
}

/// # Errors
/// Will return `Err` if the file cannot be opened or is malformed.
pub fn read_model<P: AsRef<Path>>(path: P) -> Result<GaussianModel> {
    let file = File::open(path)?;
    parse_model(BufReader::new(file))
}

/// Renders a model in the file layout, with enough digits to read it back
/// exactly.
pub fn format_model(model: &GaussianModel) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = writeln!(out, "{}", model.name);
    let _ = writeln!(out, "{:.10e}", model.nu_ref);
    let _ = writeln!(out, "{:.10e}", model.dc);
    for c in &model.components {
        let fields: Vec<String> = c.to_array().iter().map(|v| format!("{v:.10e}")).collect();
        let _ = writeln!(out, "{}", fields.join("\t "));
    }
    out
}

/// Writes `model` to `path`, appending to an existing file when `append` is
/// set.
///
/// # Errors
/// Will return `Err` if the file cannot be written.
pub fn write_model<P: AsRef<Path>>(path: P, model: &GaussianModel, append: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(path.as_ref())?;
    file.write_all(format_model(model).as_bytes())?;
    log::info!("{} written.", path.as_ref().display());
    Ok(())
}

/// Writes the standard errors of a fitted model, laid out like the model
/// itself and named `<name>_errors`.
///
/// # Errors
/// Will return `Err` if the file cannot be written.
pub fn write_model_errors<P: AsRef<Path>>(path: P, errors: &GaussianModel, append: bool) -> Result<()> {
    let mut named = errors.clone();
    named.name = format!("{}_errors", errors.name);
    write_model(path, &named, append)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_two_components() {
        let text = "J0000+0000\n1400.0\n0.01\n0.3 0.0 0.05 1e-5 1.0 -1.5\n0.6\t0.0\t0.1\t0.0\t0.4\t0.0\n";
        let model = parse_model(Cursor::new(text)).unwrap();
        assert_eq!(model.name, "J0000+0000");
        assert_eq!(model.nu_ref, 1400.0);
        assert_eq!(model.dc, 0.01);
        assert_eq!(model.ngauss(), 2);
        assert_eq!(model.components[0].wid_slope, 1e-5);
        assert_eq!(model.components[1].amp, 0.4);
    }

    #[test]
    fn rejects_short_component_line() {
        let text = "psr\n1400.0\n0.0\n0.3 0.0 0.05 0.0 1.0\n";
        assert!(matches!(
            parse_model(Cursor::new(text)),
            Err(PortraitError::MalformedModelFile(_))
        ));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(
            parse_model(Cursor::new("psr\n1400.0\n")),
            Err(PortraitError::MalformedModelFile(_))
        ));
        assert!(parse_model(Cursor::new("psr\nfast\n0.0\n")).is_err());
    }

    #[test]
    fn error_file_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gmodel_errs");
        let errs = GaussianModel::new("psr", 1400.0, 1e-3).with_component(GaussianComponent::new(1e-4, 2e-4, 3e-3));
        write_model_errors(&path, &errs, false).unwrap();
        let back = read_model(&path).unwrap();
        assert_eq!(back.name, "psr_errors");
        assert_eq!(back.components[0].wid, 2e-4);
    }

    #[test]
    fn append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gmodel");
        let model = GaussianModel::new("psr", 1400.0, 0.0);
        write_model(&path, &model, false).unwrap();
        write_model(&path, &model, true).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 6);
        write_model(&path, &model, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}
