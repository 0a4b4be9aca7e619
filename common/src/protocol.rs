//! Line protocol spoken with the device manager
//!
//! Every message is a single line: a numeric id followed by `|` separated parameters,
//! for example `113|7` asks the device manager to set the display brightness to 7.

use std::fmt::{Display, Formatter};

use thiserror::Error;

pub mod ids;

pub const SEPARATOR: char = '|';

/// Representation of a single device manager message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    id: u16,
    parameters: Vec<String>,
}

/// Type predicates a parameter can be checked against
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Str,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty message")]
    Empty,
    #[error("Message id {0:?} is not an unsigned integer")]
    BadId(String),
    #[error("Parameter {parameter:?} contains the separator")]
    Separator { parameter: String },
    #[error("Message {id} has parameters {parameters:?} which don't match the expected schema {schema:?}")]
    Schema {
        id: u16,
        parameters: Vec<String>,
        schema: Vec<ParamType>,
    },
    #[error("Unknown message id {0}")]
    UnknownId(u16),
}

impl Message {
    pub fn new(id: u16, parameters: Vec<String>) -> Self {
        Self { id, parameters }
    }

    /// Message without parameters
    pub fn empty(id: u16) -> Self {
        Self::new(id, Vec::new())
    }

    /// Message with a single parameter
    pub fn with(id: u16, parameter: impl ToString) -> Self {
        Self::new(id, vec![parameter.to_string()])
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn into_parameters(self) -> Vec<String> {
        self.parameters
    }

    pub fn to_line(&self) -> Result<String, CodecError> {
        encode(self.id, &self.parameters)
    }

    pub fn from_line(line: &str) -> Result<Self, CodecError> {
        decode(line)
    }

    /// Checks the parameters against the schema declared for this message id
    pub fn validate_declared(&self) -> Result<(), CodecError> {
        let schema = ids::schema(self.id).ok_or(CodecError::UnknownId(self.id))?;
        self.expect_schema(schema)
    }

    pub fn expect_schema(&self, schema: &[ParamType]) -> Result<(), CodecError> {
        if validate(&self.parameters, schema) {
            Ok(())
        } else {
            Err(CodecError::Schema {
                id: self.id,
                parameters: self.parameters.clone(),
                schema: schema.to_vec(),
            })
        }
    }

    /// Parses parameter `idx` as an integer, only meaningful after validation
    pub fn int(&self, idx: usize) -> Result<i64, CodecError> {
        self.parameters
            .get(idx)
            .and_then(|param| param.parse().ok())
            .ok_or_else(|| CodecError::Schema {
                id: self.id,
                parameters: self.parameters.clone(),
                schema: vec![ParamType::Int; idx + 1],
            })
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = ids::name(self.id).unwrap_or("UNKNOWN");
        write!(f, "{name}({})", self.id)?;
        for param in &self.parameters {
            write!(f, "{SEPARATOR}{param}")?;
        }

        Ok(())
    }
}

pub fn encode<S: AsRef<str>>(id: u16, parameters: &[S]) -> Result<String, CodecError> {
    let mut line = id.to_string();

    for parameter in parameters {
        let parameter = parameter.as_ref();
        if parameter.contains(SEPARATOR) || parameter.contains('\n') {
            return Err(CodecError::Separator {
                parameter: parameter.to_owned(),
            });
        }

        line.push(SEPARATOR);
        line.push_str(parameter);
    }

    Ok(line)
}

pub fn decode(line: &str) -> Result<Message, CodecError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(CodecError::Empty);
    }

    let mut fields = line.split(SEPARATOR);
    // split always yields at least one field
    let raw_id = fields.next().unwrap_or_default();
    let id = raw_id
        .parse::<u16>()
        .map_err(|_| CodecError::BadId(raw_id.to_owned()))?;

    Ok(Message {
        id,
        parameters: fields.map(str::to_owned).collect(),
    })
}

/// True iff every parameter parses into the type at the same position of `schema`
pub fn validate<S: AsRef<str>>(parameters: &[S], schema: &[ParamType]) -> bool {
    parameters.len() == schema.len()
        && parameters
            .iter()
            .zip(schema)
            .all(|(param, ty)| ty.accepts(param.as_ref()))
}

impl ParamType {
    pub fn accepts(&self, parameter: &str) -> bool {
        match self {
            ParamType::Int => parameter.parse::<i64>().is_ok(),
            ParamType::Float => parameter.parse::<f64>().is_ok(),
            ParamType::Str => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ids::*;

    #[test]
    fn round_trip() {
        assert_eq!(encode(101, &["255"]).unwrap(), "101|255");

        let message = decode("101|255").unwrap();
        assert_eq!(message.id(), 101);
        assert_eq!(message.parameters(), ["255"]);

        assert!(validate(&["255"], &[ParamType::Int]));
    }

    #[test]
    fn round_trip_many() {
        let params = vec!["a b".to_owned(), "".to_owned(), "-3.5".to_owned()];
        let line = encode(REQ_SET_BRIGHTNESS, &params).unwrap();
        let message = decode(&line).unwrap();

        assert_eq!(message, Message::new(REQ_SET_BRIGHTNESS, params));
    }

    #[test]
    fn no_parameters() {
        assert_eq!(Message::empty(REQ_PING).to_line().unwrap(), "110");
        assert_eq!(decode("110\n").unwrap(), Message::empty(REQ_PING));
    }

    #[test]
    fn malformed() {
        assert_eq!(decode(""), Err(CodecError::Empty));
        assert!(matches!(decode("abc|1"), Err(CodecError::BadId(_))));
        assert!(matches!(decode("-1"), Err(CodecError::BadId(_))));
        assert!(matches!(decode("70000"), Err(CodecError::BadId(_))));
        assert!(matches!(
            encode(REQ_SET_BRIGHTNESS, &["1|2"]),
            Err(CodecError::Separator { .. })
        ));
    }

    #[test]
    fn schema() {
        assert!(validate(&["1", "2.5", "x"], &[ParamType::Int, ParamType::Float, ParamType::Str]));
        assert!(!validate(&["2.5"], &[ParamType::Int]));
        assert!(!validate(&["1", "2"], &[ParamType::Int]));
        assert!(validate::<&str>(&[], &[]));

        let battery = decode("218|1|75|120|5").unwrap();
        assert!(battery.validate_declared().is_ok());
        assert_eq!(battery.int(1), Ok(75));

        let bad = decode("218|1|75").unwrap();
        assert!(matches!(bad.validate_declared(), Err(CodecError::Schema { .. })));

        assert_eq!(
            decode("999").unwrap().validate_declared(),
            Err(CodecError::UnknownId(999))
        );
    }
}
