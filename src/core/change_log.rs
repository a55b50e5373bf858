//! The change log: the unit of replicated mutation.
//!
//! A change log is serialized as
//! `{"id":"…","cmd":"add_route","namespace":"…","name":"…","item":{…}}`. Ids are base-36
//! nanosecond timestamps, zero padded so that lexicographic order equals creation order.
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::error::{ChangeLogError, ChangeLogResult};

/// Resource kinds a command can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Namespaces,
    Services,
    Routes,
    Modules,
    Domains,
    Collections,
    Documents,
    Secrets,
}

impl Resource {
    pub const ALL: [Resource; 8] = [
        Resource::Namespaces,
        Resource::Services,
        Resource::Routes,
        Resource::Modules,
        Resource::Domains,
        Resource::Collections,
        Resource::Documents,
        Resource::Secrets,
    ];

    /// Singular name used in command strings and admin paths.
    pub fn singular(self) -> &'static str {
        match self {
            Resource::Namespaces => "namespace",
            Resource::Services => "service",
            Resource::Routes => "route",
            Resource::Modules => "module",
            Resource::Domains => "domain",
            Resource::Collections => "collection",
            Resource::Documents => "document",
            Resource::Secrets => "secret",
        }
    }

    pub fn from_singular(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.singular() == name)
    }

    /// Whether a change to `self` can affect state derived from `other`.
    ///
    /// Not symmetric: routes depend on services and modules, but only services list routes
    /// as dependents. Domains relate to namespaces alone.
    pub fn is_related_to(self, other: Resource) -> bool {
        use Resource::*;
        if self == other || self == Namespaces || other == Namespaces {
            return true;
        }
        match self {
            Routes => matches!(other, Services | Modules),
            Services => other == Routes,
            Collections => other == Documents,
            Documents => other == Collections,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
}

/// `"{action}_{resource}"` or `"noop"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    Apply(Action, Resource),
    Noop,
}

impl Command {
    pub fn add(resource: Resource) -> Self {
        Command::Apply(Action::Add, resource)
    }

    pub fn delete(resource: Resource) -> Self {
        Command::Apply(Action::Delete, resource)
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Command::Noop)
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            Command::Apply(action, _) => Some(*action),
            Command::Noop => None,
        }
    }

    pub fn resource(&self) -> Option<Resource> {
        match self {
            Command::Apply(_, resource) => Some(*resource),
            Command::Noop => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Noop => f.write_str("noop"),
            Command::Apply(action, resource) => {
                let action = match action {
                    Action::Add => "add",
                    Action::Delete => "delete",
                };
                write!(f, "{action}_{}", resource.singular())
            }
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "noop" {
            return Ok(Command::Noop);
        }
        let (action, resource) = s
            .split_once('_')
            .ok_or_else(|| format!("invalid command: {s}"))?;
        let action = match action {
            "add" => Action::Add,
            "delete" => Action::Delete,
            _ => return Err(format!("invalid command action: {s}")),
        };
        let resource =
            Resource::from_singular(resource).ok_or_else(|| format!("invalid command resource: {s}"))?;
        Ok(Command::Apply(action, resource))
    }
}

impl TryFrom<String> for Command {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(cmd: Command) -> Self {
        cmd.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: String,
    pub cmd: Command,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub item: Value,
}

impl ChangeLog {
    pub fn new(
        cmd: Command,
        namespace: impl Into<String>,
        name: impl Into<String>,
        item: &impl Serialize,
    ) -> ChangeLogResult<Self> {
        let item = serde_json::to_value(item).map_err(|source| ChangeLogError::Decode {
            cmd: cmd.to_string(),
            source,
        })?;
        Ok(Self {
            id: next_change_id(),
            cmd,
            namespace: namespace.into(),
            name: name.into(),
            item,
        })
    }

    pub fn noop() -> Self {
        Self {
            id: next_change_id(),
            cmd: Command::Noop,
            namespace: String::new(),
            name: String::new(),
            item: Value::Null,
        }
    }

    /// Decode the item into the entity type for this command.
    pub fn decode_item<T: DeserializeOwned>(&self) -> ChangeLogResult<T> {
        T::deserialize(&self.item).map_err(|source| ChangeLogError::Decode {
            cmd: self.cmd.to_string(),
            source,
        })
    }

    /// Whether this change affects the proxy routers and therefore needs a reload.
    /// Module code and domain patterns are compiled into the router snapshot, so they count
    /// too.
    pub fn is_route_related(&self) -> bool {
        match self.cmd.resource() {
            Some(Resource::Modules | Resource::Domains) | None => true,
            Some(resource) => resource.is_related_to(Resource::Routes),
        }
    }

    /// `(kind, name, namespace)` identity used by compaction.
    pub fn target(&self) -> Option<(Resource, &str, &str)> {
        self.cmd
            .resource()
            .map(|r| (r, self.name.as_str(), self.namespace.as_str()))
    }

    pub fn to_bytes(&self) -> ChangeLogResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| ChangeLogError::Decode {
            cmd: self.cmd.to_string(),
            source,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> ChangeLogResult<Self> {
        serde_json::from_slice(bytes).map_err(|source| ChangeLogError::Decode {
            cmd: "change log".to_string(),
            source,
        })
    }
}

const ID_WIDTH: usize = 13;

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Monotonic, node-unique change log id.
pub fn next_change_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return to_base36(next),
            Err(current) => last = current,
        }
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = Vec::with_capacity(ID_WIDTH);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    while buf.len() < ID_WIDTH {
        buf.push(b'0');
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resources::Namespace;

    #[test]
    fn test_command_strings() {
        assert_eq!(Command::add(Resource::Routes).to_string(), "add_route");
        assert_eq!(
            "delete_namespace".parse::<Command>().unwrap(),
            Command::delete(Resource::Namespaces)
        );
        assert_eq!("noop".parse::<Command>().unwrap(), Command::Noop);
        assert!("add_widget".parse::<Command>().is_err());
        assert!("upsert_route".parse::<Command>().is_err());
    }

    #[test]
    fn test_wire_format() {
        let log = ChangeLog::new(
            Command::add(Resource::Namespaces),
            "n1",
            "n1",
            &Namespace::new("n1"),
        )
        .unwrap();
        let json: Value = serde_json::from_slice(&log.to_bytes().unwrap()).unwrap();
        assert_eq!(json["cmd"], "add_namespace");
        assert_eq!(json["item"]["name"], "n1");
        assert_eq!(ChangeLog::from_bytes(&log.to_bytes().unwrap()).unwrap(), log);
    }

    #[test]
    fn test_ids_are_ordered_and_unique() {
        let ids: Vec<String> = (0..1000).map(|_| next_change_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(ids.iter().all(|id| id.len() == ID_WIDTH));
    }

    #[test]
    fn test_relatedness() {
        assert!(Resource::Services.is_related_to(Resource::Routes));
        assert!(Resource::Namespaces.is_related_to(Resource::Secrets));
        assert!(Resource::Documents.is_related_to(Resource::Collections));
        assert!(!Resource::Secrets.is_related_to(Resource::Routes));
        assert!(!Resource::Documents.is_related_to(Resource::Routes));
        assert!(Resource::Routes.is_related_to(Resource::Modules));
        assert!(!Resource::Modules.is_related_to(Resource::Routes));
        assert!(!Resource::Domains.is_related_to(Resource::Routes));
        assert!(!Resource::Routes.is_related_to(Resource::Domains));
        assert!(Resource::Domains.is_related_to(Resource::Namespaces));
        assert!(ChangeLog::noop().is_route_related());

        let item = serde_json::json!({"name": "m"});
        let module = ChangeLog::new(Command::add(Resource::Modules), "n", "m", &item).unwrap();
        let domain = ChangeLog::new(Command::delete(Resource::Domains), "n", "m", &item).unwrap();
        let secret = ChangeLog::new(Command::add(Resource::Secrets), "n", "m", &item).unwrap();
        assert!(module.is_route_related());
        assert!(domain.is_route_related());
        assert!(!secret.is_route_related());
    }
}
