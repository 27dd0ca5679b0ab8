use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum StatisticValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    ByteSize(u64),
    // Stored as a fraction where 1.0 is 100%
    Percentage(f64),
    String(String),
}

/// A single named value produced when reporting on, or collecting statistics from, the
/// streaming system.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Statistic {
    pub owner: String,
    pub name: String,
    pub value: StatisticValue,
    pub description: String,
}

impl Statistic {
    fn new(
        owner: &str,
        name: &str,
        value: StatisticValue,
        description: &str,
    ) -> Self {
        Statistic {
            owner: owner.to_string(),
            name: name.to_string(),
            value,
            description: description.to_string(),
        }
    }

    pub fn create_boolean(
        owner: &str,
        name: &str,
        value: bool,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::Boolean(value), description)
    }

    pub fn create_integer(
        owner: &str,
        name: &str,
        value: i64,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::Integer(value), description)
    }

    pub fn create_float(
        owner: &str,
        name: &str,
        value: f64,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::Float(value), description)
    }

    pub fn create_byte_size(
        owner: &str,
        name: &str,
        value: u64,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::ByteSize(value), description)
    }

    pub fn create_percentage(
        owner: &str,
        name: &str,
        value: f64,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::Percentage(value), description)
    }

    pub fn create_string(
        owner: &str,
        name: &str,
        value: String,
        description: &str,
    ) -> Self {
        Self::new(owner, name, StatisticValue::String(value), description)
    }
}
