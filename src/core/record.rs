// Record instances: one descriptor, one value per field, optional metadata.
use std::fmt;

use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Descriptor;
use crate::core::value::{self, Value};

#[derive(Clone)]
pub struct Record {
    descriptor: Descriptor,
    values: Vec<Value>,
    source: Option<String>,
    generated: Option<OffsetDateTime>,
}

impl Record {
    /// Builds a record from named values; fields not supplied are `Null`.
    pub fn new<K, V>(
        descriptor: &Descriptor,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, Error>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut slots = vec![Value::Null; descriptor.fields().len()];
        for (name, value) in values {
            let name = name.as_ref();
            let Some(idx) = descriptor.field_index(name) else {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "descriptor `{}` has no field `{name}`",
                    descriptor.name()
                )));
            };
            slots[idx] = value.into().coerce(name, descriptor.fields()[idx].ty)?;
        }
        Ok(Self {
            descriptor: descriptor.clone(),
            values: slots,
            source: None,
            generated: None,
        })
    }

    /// Builds a record from values already in descriptor order.
    pub fn from_values(descriptor: &Descriptor, values: Vec<Value>) -> Result<Self, Error> {
        if values.len() != descriptor.fields().len() {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "descriptor `{}` has {} fields, got {} values",
                descriptor.name(),
                descriptor.fields().len(),
                values.len()
            )));
        }
        let values = values
            .into_iter()
            .zip(descriptor.fields())
            .map(|(value, field)| value.coerce(&field.name, field.ty))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            descriptor: descriptor.clone(),
            values,
            source: None,
            generated: None,
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_generated(mut self, generated: OffsetDateTime) -> Self {
        self.generated = Some(generated);
        self
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.descriptor
            .field_index(field)
            .map(|idx| &self.values[idx])
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.descriptor
            .fields()
            .iter()
            .map(|field| field.name.as_str())
            .zip(self.values.iter())
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn generated(&self) -> Option<OffsetDateTime> {
        self.generated
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(
            "_desc".to_string(),
            JsonValue::String(self.descriptor.name().to_string()),
        );
        if let Some(source) = &self.source {
            map.insert("_source".to_string(), JsonValue::String(source.clone()));
        }
        if let Some(text) = self.generated.as_ref().and_then(value::format_datetime) {
            map.insert("_generated".to_string(), JsonValue::String(text));
        }
        for (name, value) in self.fields() {
            map.insert(name.to_string(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor && self.values == other.values
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.descriptor.name())?;
        for (name, value) in self.fields() {
            write!(f, " {name}={value}")?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::Record;
    use crate::core::error::ErrorKind;
    use crate::core::schema::Descriptor;
    use crate::core::value::Value;
    use serde_json::json;
    use time::macros::datetime;

    fn descriptor() -> Descriptor {
        Descriptor::new(
            "test/record",
            [("string", "name"), ("string", "foo"), ("varint", "idx")],
        )
        .expect("descriptor")
    }

    #[test]
    fn missing_fields_default_to_null() {
        let record = Record::new(&descriptor(), [("name", "a")]).expect("record");
        assert_eq!(record.get("foo"), Some(&Value::Null));
        assert_eq!(record.get("nope"), None);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = Record::new(&descriptor(), [("bar", "x")]).expect_err("unknown field");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn equality_ignores_metadata() {
        let d = descriptor();
        let a = Record::new(&d, [("name", Value::from("a")), ("idx", Value::from(1))]).unwrap();
        let b = a
            .clone()
            .with_source("other")
            .with_generated(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(a, b);
        let c = Record::new(&d, [("name", Value::from("a")), ("idx", Value::from(2))]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn from_values_checks_arity() {
        let err = Record::from_values(&descriptor(), vec![Value::Null]).expect_err("arity");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn renders_text_and_json() {
        let record = Record::new(
            &descriptor(),
            [("name", Value::from("record0")), ("foo", "bar".into()), ("idx", 0.into())],
        )
        .unwrap()
        .with_source("unit");
        assert_eq!(
            record.to_string(),
            "<test/record name='record0' foo='bar' idx=0>"
        );
        assert_eq!(
            record.to_json(),
            json!({"_desc": "test/record", "_source": "unit", "name": "record0", "foo": "bar", "idx": 0})
        );
    }
}
