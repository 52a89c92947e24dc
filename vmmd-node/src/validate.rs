//! Typed access to request fields.
//!
//! Every accessor either returns the field in the shape a handler needs or a
//! [`CommandError`] whose template names the field and whose arguments carry
//! the value received. Handlers validate all fields before their first
//! collaborator call.

use serde_json::Value;

use vmmd_hypervisor::CloneSubstitutions;
use vmmd_proto::{CommandError, Domain, Request, TargetState};

static NULL: Value = Value::Null;

/// Fields of one request, checked on behalf of `command`.
pub struct Fields<'a> {
    command: &'static str,
    request: &'a Request,
}

impl<'a> Fields<'a> {
    pub fn new(command: &'static str, request: &'a Request) -> Self {
        Self { command, request }
    }

    /// Raw value of a field; absent fields read as `null`.
    fn raw(&self, name: &str) -> &'a Value {
        self.request.field(name).unwrap_or(&NULL)
    }

    fn mismatch(&self, name: &str, expected: &str) -> CommandError {
        CommandError::new(self.command, format!("{name} != {expected}: {{{name}}}"))
            .arg(name, self.raw(name).clone())
    }

    pub fn string(&self, name: &str) -> Result<&'a str, CommandError> {
        self.raw(name)
            .as_str()
            .ok_or_else(|| self.mismatch(name, "string"))
    }

    /// A string that may be absent or `null`.
    pub fn optional_string(&self, name: &str) -> Result<Option<&'a str>, CommandError> {
        match self.raw(name) {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value.as_str())),
            _ => Err(self.mismatch(name, "string")),
        }
    }

    pub fn string_or(&self, name: &str, default: &'a str) -> Result<&'a str, CommandError> {
        Ok(self.optional_string(name)?.unwrap_or(default))
    }

    /// A JSON integer `>= 0`.
    pub fn uint(&self, name: &str) -> Result<u64, CommandError> {
        self.raw(name).as_u64().ok_or_else(|| self.mismatch(name, "int"))
    }

    pub fn string_list(&self, name: &str) -> Result<Vec<String>, CommandError> {
        let items = self
            .raw(name)
            .as_array()
            .ok_or_else(|| self.mismatch(name, "list"))?;
        self.strings(name, items)
    }

    /// A list of strings that must be present but may be `null`.
    pub fn nullable_string_list(&self, name: &str) -> Result<Option<Vec<String>>, CommandError> {
        match self.request.field(name) {
            Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => self.strings(name, items).map(Some),
            _ => Err(self.mismatch(name, "list or None")),
        }
    }

    fn strings(&self, name: &str, items: &[Value]) -> Result<Vec<String>, CommandError> {
        items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    CommandError::new(self.command, format!("{name}[] != string: {{item}}"))
                        .arg("item", item.clone())
                })
            })
            .collect()
    }

    /// One of the power state tokens.
    pub fn target_state(&self, name: &str) -> Result<TargetState, CommandError> {
        self.raw(name)
            .as_str()
            .and_then(TargetState::from_token)
            .ok_or_else(|| {
                CommandError::new(self.command, format!("unsupported state: {{{name}}}"))
                    .arg(name, self.raw(name).clone())
            })
    }

    /// A full domain definition.
    pub fn domain(&self, name: &str) -> Result<Domain, CommandError> {
        let value = self.raw(name);
        if !value.is_object() {
            return Err(self.mismatch(name, "Domain"));
        }
        serde_json::from_value(value.clone()).map_err(|err| {
            self.mismatch(name, "Domain")
                .arg("error", err.to_string())
        })
    }

    /// Clone substitutions: an object of strings or `null`s.
    pub fn substitutions(&self, name: &str) -> Result<CloneSubstitutions, CommandError> {
        let map = self
            .raw(name)
            .as_object()
            .ok_or_else(|| self.mismatch(name, "dict"))?;
        map.iter()
            .map(|(key, value)| match value {
                Value::Null => Ok((key.clone(), None)),
                Value::String(s) => Ok((key.clone(), Some(s.clone()))),
                other => Err(CommandError::new(
                    self.command,
                    format!("{name}[{{key}}] != string: {{value}}"),
                )
                .arg("key", key.clone())
                .arg("value", other.clone())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Request {
        Request::new("TEST")
            .with("uri", "qemu:///system")
            .with("hz", 1500)
            .with("negative", -1)
            .with("volumes", json!(["/a", "/b"]))
            .with("mixed", json!(["/a", 3]))
            .with("nothing", Value::Null)
            .with("state", "PAUSE")
            .with("subst", json!({"mac": "auto", "name#vda": null}))
    }

    #[test]
    fn test_string() {
        let request = request();
        let fields = Fields::new("TEST", &request);

        assert_eq!(fields.string("uri").unwrap(), "qemu:///system");

        let err = fields.string("hz").unwrap_err();
        assert_eq!(err.template(), "hz != string: {hz}");
        assert_eq!(err.args()["hz"], json!(1500));
        assert_eq!(err.args()["command"], json!("TEST"));

        let err = fields.string("missing").unwrap_err();
        assert_eq!(err.text.render(), "missing != string: None");
    }

    #[test]
    fn test_optional_string() {
        let request = request();
        let fields = Fields::new("TEST", &request);

        assert_eq!(fields.optional_string("missing").unwrap(), None);
        assert_eq!(fields.optional_string("nothing").unwrap(), None);
        assert_eq!(fields.string_or("missing", "*").unwrap(), "*");
        assert!(fields.optional_string("hz").is_err());
    }

    #[test]
    fn test_uint() {
        let request = request();
        let fields = Fields::new("TEST", &request);

        assert_eq!(fields.uint("hz").unwrap(), 1500);
        assert_eq!(fields.uint("negative").unwrap_err().template(), "negative != int: {negative}");
        assert!(fields.uint("uri").is_err());
    }

    #[test]
    fn test_lists() {
        let request = request();
        let fields = Fields::new("TEST", &request);

        assert_eq!(fields.string_list("volumes").unwrap(), ["/a", "/b"]);
        let err = fields.string_list("mixed").unwrap_err();
        assert_eq!(err.template(), "mixed[] != string: {item}");
        assert_eq!(err.args()["item"], json!(3));

        assert_eq!(fields.nullable_string_list("nothing").unwrap(), None);
        assert!(fields.nullable_string_list("missing").is_err());
        assert_eq!(
            fields.nullable_string_list("volumes").unwrap(),
            Some(vec!["/a".to_string(), "/b".to_string()])
        );
    }

    #[test]
    fn test_target_state() {
        let request = request().with("bogus", "FOO");
        let fields = Fields::new("TEST", &request);

        assert_eq!(fields.target_state("state").unwrap(), TargetState::Pause);
        let err = fields.target_state("bogus").unwrap_err();
        assert_eq!(err.text.render(), "unsupported state: FOO");
    }

    #[test]
    fn test_domain() {
        let request = request().with("domain", json!({"name": "vm", "vcpus": 2}));
        let fields = Fields::new("TEST", &request);

        let domain = fields.domain("domain").unwrap();
        assert_eq!(domain.name, "vm");
        assert_eq!(domain.vcpus, 2);

        assert_eq!(fields.domain("uri").unwrap_err().template(), "uri != Domain: {uri}");

        let request = Request::new("TEST").with("domain", json!({"vcpus": "many"}));
        let err = Fields::new("TEST", &request).domain("domain").unwrap_err();
        assert!(err.args().contains_key("error"));
    }

    #[test]
    fn test_substitutions() {
        let request = request().with("bad", json!({"mac": 1}));
        let fields = Fields::new("TEST", &request);

        let subst = fields.substitutions("subst").unwrap();
        assert_eq!(subst["mac"].as_deref(), Some("auto"));
        assert_eq!(subst["name#vda"], None);

        assert!(fields.substitutions("uri").is_err());
        assert!(fields.substitutions("bad").is_err());
    }
}
