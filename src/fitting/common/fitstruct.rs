use std::fmt;

/// What a fit parameter represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParameterRole {
    Dc,
    /// Scattering timescale [rot] at the reference frequency.
    ScatteringTime,
    ScatteringIndex,
    Location,
    LocationSlope,
    Width,
    WidthSlope,
    Amplitude,
    AmplitudeIndex,
    PowerLawAmplitude,
    PowerLawIndex,
    /// Phase offset [rot] of a joined band; the component index is the band.
    JoinPhase,
    /// DM offset [cm**-3 pc] of a joined band.
    JoinDm,
}

impl ParameterRole {
    fn prefix(&self) -> &'static str {
        match self {
            ParameterRole::Dc => "dc",
            ParameterRole::ScatteringTime => "tau",
            ParameterRole::ScatteringIndex => "tau_index",
            ParameterRole::Location => "loc",
            ParameterRole::LocationSlope => "m_loc",
            ParameterRole::Width => "wid",
            ParameterRole::WidthSlope => "m_wid",
            ParameterRole::Amplitude => "amp",
            ParameterRole::AmplitudeIndex => "alpha",
            ParameterRole::PowerLawAmplitude => "A",
            ParameterRole::PowerLawIndex => "index",
            ParameterRole::JoinPhase => "phi_join",
            ParameterRole::JoinDm => "dm_join",
        }
    }
}

/// One row of a [`ParameterTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub role: ParameterRole,
    /// Gaussian component this parameter belongs to, if any.
    pub component: Option<usize>,
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub vary: bool,
    /// Standard error after a fit.
    pub stderr: Option<f64>,
}

impl Parameter {
    pub fn new(role: ParameterRole, component: Option<usize>, value: f64) -> Self {
        Parameter {
            role,
            component,
            value,
            lower: None,
            upper: None,
            vary: true,
            stderr: None,
        }
    }

    pub fn min(mut self, lower: f64) -> Self {
        self.lower = Some(lower);
        self
    }

    pub fn max(mut self, upper: f64) -> Self {
        self.upper = Some(upper);
        self
    }

    pub fn vary(mut self, vary: bool) -> Self {
        self.vary = vary;
        self
    }

    /// `loc1`, `m_wid3`, `dc`, ... (components counted from one).
    pub fn name(&self) -> String {
        match self.component {
            Some(i) => format!("{}{}", self.role.prefix(), i + 1),
            None => self.role.prefix().to_string(),
        }
    }

    /// The value moved inside the bounds, if it lies outside them.
    pub fn clamped(&self) -> f64 {
        let mut v = self.value;
        if let Some(lo) = self.lower {
            v = v.max(lo);
        }
        if let Some(hi) = self.upper {
            v = v.min(hi);
        }
        v
    }
}

/// Ordered, fixed-schema set of fit parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterTable {
    params: Vec<Parameter>,
}

impl ParameterTable {
    pub fn new() -> Self {
        ParameterTable::default()
    }

    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    pub fn num_varying(&self) -> usize {
        self.params.iter().filter(|p| p.vary).count()
    }

    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// Standard errors, zero for parameters that were held fixed.
    pub fn stderrs(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.stderr.unwrap_or(0.0)).collect()
    }

    pub fn find(&self, role: ParameterRole, component: Option<usize>) -> Option<&Parameter> {
        self.params
            .iter()
            .find(|p| p.role == role && p.component == component)
    }

    pub fn find_mut(&mut self, role: ParameterRole, component: Option<usize>) -> Option<&mut Parameter> {
        self.params
            .iter_mut()
            .find(|p| p.role == role && p.component == component)
    }

    /// Writes fitted values (and optionally their errors) back in order.
    pub(crate) fn update(&mut self, values: &[f64], errors: Option<&[f64]>) {
        for (i, p) in self.params.iter_mut().enumerate() {
            p.value = values[i];
            if let Some(errs) = errors {
                p.stderr = Some(if p.vary { errs[i] } else { 0.0 });
            }
        }
    }
}

impl std::ops::Index<usize> for ParameterTable {
    type Output = Parameter;

    fn index(&self, index: usize) -> &Parameter {
        &self.params[index]
    }
}

impl fmt::Display for ParameterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.params {
            let err = p.stderr.map_or_else(|| "-".to_string(), |e| format!("{e:.3e}"));
            writeln!(
                f,
                "{:<8} {:>16.8e} +/- {:<10} {}",
                p.name(),
                p.value,
                err,
                if p.vary { "" } else { "(fixed)" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_components() {
        let p = Parameter::new(ParameterRole::WidthSlope, Some(2), 0.0);
        assert_eq!(p.name(), "m_wid3");
        assert_eq!(Parameter::new(ParameterRole::Dc, None, 0.0).name(), "dc");
    }

    #[test]
    fn clamp_and_update() {
        let mut table = ParameterTable::new();
        table.push(Parameter::new(ParameterRole::Dc, None, 1.0));
        table.push(Parameter::new(ParameterRole::Width, Some(0), -0.5).min(0.0).vary(false));
        assert_eq!(table[1].clamped(), 0.0);
        assert_eq!(table.num_varying(), 1);
        table.update(&[2.0, 0.1], Some(&[0.3, 0.4]));
        assert_eq!(table.values(), vec![2.0, 0.1]);
        assert_eq!(table.stderrs(), vec![0.3, 0.0]);
        assert!(table.find(ParameterRole::Width, Some(0)).is_some());
        assert!(table.find(ParameterRole::Width, Some(1)).is_none());
    }
}
