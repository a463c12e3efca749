//! Phase and DM offsets that join observations from different receivers
//! before they are modelled together.
use crate::error::PortraitError;
use crate::fitting::common::error::FittingError;
use crate::utils::portrait::{rotate_portrait, Dispersion, Portrait};
use indexmap::IndexMap;
use ndarray::{Array2, ArrayView1, Axis};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

type Result<T> = std::result::Result<T, PortraitError>;

const HEADER: &str = "# archive name                                -phase offset & err [rot]  -delta-DM & err [cm**-3 pc]";

/// Offsets of one observation. They are stored negated: apply them to the
/// data by rotating by `-phase` and `-dm`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct JoinParameters {
    pub phase: f64,
    pub phase_err: f64,
    pub dm: f64,
    pub dm_err: f64,
}

impl JoinParameters {
    /// Rotates `channels` of `portrait` into alignment with the joint model,
    /// or back out of it when `undo` is set.
    ///
    /// # Errors
    /// Will return `Err` if a channel index is out of range.
    pub fn apply(&self, portrait: &mut Portrait, channels: &[usize], nu_ref: f64, undo: bool) -> Result<()> {
        if let Some(&bad) = channels.iter().find(|&&i| i >= portrait.nchan()) {
            return Err(FittingError::ShapeMismatch(format!(
                "channel {} of a {}-channel portrait",
                bad,
                portrait.nchan()
            ))
            .into());
        }
        let sign = if undo { -1.0 } else { 1.0 };
        let period = portrait.period;
        rotate_channels(
            &mut portrait.data,
            channels,
            portrait.freqs.view(),
            -self.phase * sign,
            -self.dm * sign,
            period,
            nu_ref,
        );
        Ok(())
    }
}

/// Rotates the rows `channels` of `data` by `phase` plus the dispersive delay
/// of `dm`, leaving the other rows alone. Indices must be in range.
pub(crate) fn rotate_channels(
    data: &mut Array2<f64>,
    channels: &[usize],
    freqs: ArrayView1<f64>,
    phase: f64,
    dm: f64,
    period: f64,
    nu_ref: f64,
) {
    let subset = data.select(Axis(0), channels);
    let freqs = freqs.select(Axis(0), channels);
    let dispersion = Dispersion::new(dm, period, freqs.view(), nu_ref);
    let rotated = rotate_portrait(subset.view(), phase, Some(&dispersion));
    for (row, &ichan) in rotated.axis_iter(Axis(0)).zip(channels) {
        data.row_mut(ichan).assign(&row);
    }
}

/// A receiver band of a combined portrait: the channels taken from one
/// observation, and the offsets that join them to the rest.
///
/// In a joint model fit the band's model rows are rotated by `params.phase`
/// and `params.dm`, so the fitted values are the ones
/// [`JoinParameters::apply`] removes from the data.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinBand {
    pub name: String,
    pub channels: Vec<usize>,
    /// Starting (or held) offsets.
    pub params: JoinParameters,
    pub fit_phase: bool,
    pub fit_dm: bool,
}

impl JoinBand {
    pub fn new(name: &str, channels: Vec<usize>) -> Self {
        JoinBand {
            name: name.to_string(),
            channels,
            params: JoinParameters::default(),
            fit_phase: true,
            fit_dm: true,
        }
    }

    pub fn with_params(mut self, params: JoinParameters) -> Self {
        self.params = params;
        self
    }

    /// Holds the phase offset, as for the band the others are joined to.
    pub fn fixed_phase(mut self) -> Self {
        self.fit_phase = false;
        self
    }
}

/// Join parameters keyed by archive name, in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinTable {
    pub entries: IndexMap<String, JoinParameters>,
}

impl JoinTable {
    pub fn new() -> Self {
        JoinTable::default()
    }

    pub fn insert(&mut self, name: &str, params: JoinParameters) {
        self.entries.insert(name.to_string(), params);
    }

    /// The current offsets of each band, in band order.
    pub fn from_bands(bands: &[JoinBand]) -> JoinTable {
        let mut table = JoinTable::new();
        for band in bands {
            table.insert(&band.name, band.params);
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&JoinParameters> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads `name phase [phase_err] dDM [dDM_err]` lines, skipping `#`
    /// comments. Three-field lines carry no errors.
    ///
    /// # Errors
    /// Will return `Err` if a line has fewer than three fields or a
    /// non-numeric value.
    pub fn parse<R: BufRead>(reader: R) -> Result<JoinTable> {
        let mut table = JoinTable::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let value = |j: usize| -> Result<f64> {
                fields[j].parse::<f64>().map_err(|_| {
                    PortraitError::MalformedJoinFile(format!("Unable to read field {} of line {}: {:?}", j + 1, i + 1, fields[j]))
                })
            };
            let params = match fields.len() {
                3 => JoinParameters {
                    phase: value(1)?,
                    phase_err: 0.0,
                    dm: value(2)?,
                    dm_err: 0.0,
                },
                4 => JoinParameters {
                    phase: value(1)?,
                    phase_err: value(2)?,
                    dm: value(3)?,
                    dm_err: 0.0,
                },
                n if n >= 5 => JoinParameters {
                    phase: value(1)?,
                    phase_err: value(2)?,
                    dm: value(3)?,
                    dm_err: value(4)?,
                },
                n => {
                    return Err(PortraitError::MalformedJoinFile(format!(
                        "Line {} has {} fields, expected at least 3",
                        i + 1,
                        n
                    )))
                }
            };
            table.insert(fields[0], params);
        }
        Ok(table)
    }

    /// # Errors
    /// Will return `Err` if the file cannot be opened or is malformed.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<JoinTable> {
        let file = File::open(path)?;
        JoinTable::parse(BufReader::new(file))
    }

    /// Renders the table in the five-column layout under a header comment.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{HEADER}");
        for (name, p) in &self.entries {
            let _ = writeln!(
                out,
                "{:<45}{}{:.10} {:.10}  {}{:.6} {:.6}",
                name,
                if p.phase < 0.0 { "-" } else { " " },
                p.phase.abs(),
                p.phase_err,
                if p.dm < 0.0 { "-" } else { " " },
                p.dm.abs(),
                p.dm_err
            );
        }
        out
    }

    /// # Errors
    /// Will return `Err` if the file cannot be written.
    pub fn write<P: AsRef<Path>>(&self, path: P, append: bool) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path.as_ref())?;
        file.write_all(self.format().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array1};
    use std::io::Cursor;

    #[test]
    fn accepts_legacy_and_current_lines() {
        let text = "# archive name  -phase offset & err [rot]  -delta-DM & err [cm**-3 pc]\n\
                    a.ar 0.01 -0.002\n\
                    b.ar -0.25 0.001 0.003\n\
                    c.ar 0.125 0.0005 -0.004 0.0001\n";
        let table = JoinTable::parse(Cursor::new(text)).unwrap();
        assert_eq!(table.len(), 3);
        let names: Vec<&String> = table.entries.keys().collect();
        assert_eq!(names, ["a.ar", "b.ar", "c.ar"]);
        assert_eq!(
            table.get("a.ar"),
            Some(&JoinParameters {
                phase: 0.01,
                phase_err: 0.0,
                dm: -0.002,
                dm_err: 0.0
            })
        );
        assert_eq!(table.get("b.ar").map(|p| p.dm), Some(0.003));
        assert_eq!(table.get("c.ar").map(|p| p.dm_err), Some(0.0001));
    }

    #[test]
    fn rejects_short_lines() {
        assert!(matches!(
            JoinTable::parse(Cursor::new("a.ar 0.1\n")),
            Err(PortraitError::MalformedJoinFile(_))
        ));
        assert!(JoinTable::parse(Cursor::new("a.ar x 0.1\n")).is_err());
    }

    #[test]
    fn written_table_reads_back() {
        let mut table = JoinTable::new();
        table.insert(
            "lband.ar",
            JoinParameters {
                phase: -0.0123456789,
                phase_err: 1.5e-5,
                dm: 0.000321,
                dm_err: 2e-6,
            },
        );
        table.insert("sband.ar", JoinParameters::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.join");
        table.write(&path, false).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# archive name"));
        let back = JoinTable::read(&path).unwrap();
        let p = back.get("lband.ar").unwrap();
        assert_abs_diff_eq!(p.phase, -0.0123456789, epsilon = 1e-10);
        assert_abs_diff_eq!(p.dm, 0.000321, epsilon = 1e-6);
        assert_eq!(back.get("sband.ar"), Some(&JoinParameters::default()));
    }

    #[test]
    fn apply_then_undo_restores_channels() {
        let data = Array::from_shape_fn((4, 64), |(c, b)| {
            let x = b as f64 / 64.0;
            (-(x - 0.4).powi(2) / 0.003).exp() * (1.0 + c as f64)
        });
        let freqs = Array1::linspace(700.0, 900.0, 4);
        let original = Portrait::new(data.clone(), freqs, 0.005).unwrap();
        let mut portrait = original.clone();
        let params = JoinParameters {
            phase: 0.1,
            phase_err: 0.0,
            dm: 0.01,
            dm_err: 0.0,
        };
        params.apply(&mut portrait, &[2, 3], 800.0, false).unwrap();
        assert_eq!(portrait.data.row(0), original.data.row(0));
        let dispersion = Dispersion::new(-0.01, 0.005, original.freqs.view(), 800.0);
        let expected = rotate_portrait(original.data.view(), -0.1, Some(&dispersion));
        for (a, b) in portrait.data.row(3).iter().zip(expected.row(3).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        params.apply(&mut portrait, &[2, 3], 800.0, true).unwrap();
        for (a, b) in portrait.data.iter().zip(original.data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        assert!(params.apply(&mut portrait, &[4], 800.0, false).is_err());
    }
}
