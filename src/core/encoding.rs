use super::error::ConfigError;
use super::types::{InputValue, ParameterDef};
use indexmap::IndexMap;
use rand::Rng;
use std::collections::HashSet;

/// Decoded inputs, in declaration order.
pub type NamedValues = IndexMap<String, InputValue>;

/// Flat-vector layout of an ordered parameter list.
///
/// Parameter `k` occupies `offset(k)..offset(k) + variable_count(k)`, where the
/// offset is the running sum of the preceding variable counts.
#[derive(Clone, Debug)]
pub struct ParameterLayout {
    params: Vec<ParameterDef>,
    offsets: Vec<usize>,
    dimension: usize,
}

impl ParameterLayout {
    pub fn new(params: Vec<ParameterDef>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut offsets = Vec::with_capacity(params.len());
        let mut dimension = 0;

        for param in &params {
            param.validate()?;
            if !seen.insert(param.name.as_str()) {
                return Err(ConfigError::DuplicateName(param.name.clone()));
            }
            offsets.push(dimension);
            dimension += param.kind.variable_count();
        }

        if dimension == 0 {
            return Err(ConfigError::EmptyDimension);
        }

        Ok(Self {
            params,
            offsets,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> &[ParameterDef] {
        &self.params
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.params
            .iter()
            .position(|p| p.name == name)
            .map(|idx| self.offsets[idx])
    }

    pub fn encode(&self, inputs: &NamedValues) -> Result<Vec<f64>, ConfigError> {
        let mut flat = Vec::with_capacity(self.dimension);
        for param in &self.params {
            let value = inputs
                .get(&param.name)
                .ok_or_else(|| ConfigError::MissingInput(param.name.clone()))?;
            param.kind.encode(&param.name, value, &mut flat)?;
        }
        Ok(flat)
    }

    /// Decodes `flat` into named values. Trailing entries past the declared
    /// dimension are ignored.
    pub fn decode(&self, flat: &[f64]) -> Result<NamedValues, ConfigError> {
        if flat.len() < self.dimension {
            return Err(ConfigError::VectorTooShort {
                expected: self.dimension,
                actual: flat.len(),
            });
        }

        Ok(self
            .params
            .iter()
            .zip(&self.offsets)
            .map(|(param, &offset)| {
                let slots = &flat[offset..offset + param.kind.variable_count()];
                (param.name.clone(), param.kind.decode(slots))
            })
            .collect())
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.params.iter().flat_map(|p| p.kind.lower_bounds()).collect()
    }

    pub fn upper_bounds(&self) -> Vec<f64> {
        self.params.iter().flat_map(|p| p.kind.upper_bounds()).collect()
    }

    pub fn given_start(&self) -> Vec<f64> {
        self.params.iter().flat_map(|p| p.kind.given_start()).collect()
    }

    pub fn default_tolerances(&self) -> Vec<f64> {
        self.params.iter().flat_map(|p| p.kind.default_tolerance()).collect()
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.params.iter().flat_map(|p| p.variable_names()).collect()
    }

    /// Display name of flat slot `index`.
    pub fn variable_name(&self, index: usize) -> Option<String> {
        let idx = self.offsets.partition_point(|&o| o <= index).checked_sub(1)?;
        let param = &self.params[idx];
        let local = index - self.offsets[idx];
        param.variable_names().into_iter().nth(local)
    }

    /// Builds the solver start vector from each parameter's start strategy.
    pub fn start_vector<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.params.iter().flat_map(|p| p.start_values(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point3;

    fn layout() -> ParameterLayout {
        ParameterLayout::new(vec![
            ParameterDef::scalar("Width", 0.0, 10.0, 2.5),
            ParameterDef::point(
                "Apex",
                Point3::new(-1.0, -1.0, 0.0),
                Point3::new(1.0, 1.0, 5.0),
                Point3::new(0.25, -0.5, 3.0),
            ),
            ParameterDef::integer("Bays", 1, 8, 4),
        ])
        .unwrap()
    }

    #[test]
    fn offsets_are_running_sums() {
        let layout = layout();
        assert_eq!(layout.dimension(), 5);
        assert_eq!(layout.offset_of("Width"), Some(0));
        assert_eq!(layout.offset_of("Apex"), Some(1));
        assert_eq!(layout.offset_of("Bays"), Some(4));
        assert_eq!(layout.offset_of("Missing"), None);
    }

    #[test]
    fn decode_preserves_order_and_reencodes_exactly() {
        let layout = layout();
        let flat = vec![0.1 + 0.2, 0.3, -0.7, 4.125, 6.0];
        let decoded = layout.decode(&flat).unwrap();
        let names: Vec<&str> = decoded.keys().map(String::as_str).collect();
        assert_eq!(names, ["Width", "Apex", "Bays"]);

        let encoded = layout.encode(&decoded).unwrap();
        let bits: Vec<u64> = encoded.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u64> = flat.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn short_vector_is_a_configuration_error() {
        let err = layout().decode(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::VectorTooShort {
                expected: 5,
                actual: 2
            }
        ));
    }

    #[test]
    fn missing_input_is_reported() {
        let mut values = layout().decode(&[1.0, 0.0, 0.0, 1.0, 2.0]).unwrap();
        values.shift_remove("Apex");
        assert!(matches!(layout().encode(&values), Err(ConfigError::MissingInput(n)) if n == "Apex"));
    }

    #[test]
    fn bounds_and_names_follow_layout() {
        let layout = layout();
        assert_eq!(layout.lower_bounds(), vec![0.0, -1.0, -1.0, 0.0, 1.0]);
        assert_eq!(layout.upper_bounds(), vec![10.0, 1.0, 1.0, 5.0, 8.0]);
        assert_eq!(layout.variable_name(0).as_deref(), Some("Width"));
        assert_eq!(layout.variable_name(2).as_deref(), Some("Apex - Y"));
        assert_eq!(layout.variable_name(4).as_deref(), Some("Bays"));
        assert_eq!(layout.variable_name(5), None);
        assert_eq!(layout.given_start(), vec![2.5, 0.25, -0.5, 3.0, 4.0]);
    }

    #[test]
    fn duplicate_and_empty_layouts_are_rejected() {
        let dup = ParameterLayout::new(vec![
            ParameterDef::scalar("a", 0.0, 1.0, 0.5),
            ParameterDef::scalar("a", 0.0, 1.0, 0.5),
        ]);
        assert!(matches!(dup, Err(ConfigError::DuplicateName(_))));
        assert!(matches!(ParameterLayout::new(Vec::new()), Err(ConfigError::EmptyDimension)));
    }
}
