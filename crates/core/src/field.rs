use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A caller-declared field: either absent (no opinion, the server value wins)
/// or explicitly set (the value is asserted on every apply).
///
/// Use with `#[serde(default, skip_serializing_if = "Field::is_absent")]` so an
/// absent field never reaches the wire, not even as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Field<T> {
    #[default]
    Absent,
    Set(T),
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool { matches!(self, Field::Absent) }

    pub fn is_set(&self) -> bool { matches!(self, Field::Set(_)) }

    pub fn get(&self) -> Option<&T> {
        match self {
            Field::Set(v) => Some(v),
            Field::Absent => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Field::Set(v) => Some(v),
            Field::Absent => None,
        }
    }

    pub fn from_option(v: Option<T>) -> Self {
        match v {
            Some(v) => Field::Set(v),
            None => Field::Absent,
        }
    }
}

impl<T> From<T> for Field<T> {
    fn from(v: T) -> Self { Field::Set(v) }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Set(v) => v.serialize(serializer),
            Field::Absent => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // `null` on the wire carries no value either way.
        Option::<T>::deserialize(deserializer).map(Field::from_option)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Spec {
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        replicas: Field<i32>,
        #[serde(default, skip_serializing_if = "Field::is_absent")]
        paused: Field<bool>,
    }

    #[test]
    fn absent_is_omitted_and_zero_is_kept() {
        let spec = Spec { replicas: Field::Set(0), paused: Field::Absent };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v, json!({ "replicas": 0 }));
    }

    #[test]
    fn missing_and_null_both_read_as_absent() {
        let a: Spec = serde_json::from_value(json!({})).unwrap();
        assert!(a.replicas.is_absent());
        let b: Spec = serde_json::from_value(json!({ "replicas": null, "paused": false })).unwrap();
        assert!(b.replicas.is_absent());
        assert_eq!(b.paused, Field::Set(false));
    }

    #[test]
    fn conversions() {
        let f: Field<&str> = "x".into();
        assert_eq!(f.get(), Some(&"x"));
        assert_eq!(Field::<u8>::from_option(None), Field::Absent);
        assert_eq!(Field::Set(3).into_option(), Some(3));
    }
}
