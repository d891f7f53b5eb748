//! Command categories, registered callbacks, and the alias table.
//!
//! The registry is populated before `start()` and becomes immutable once the
//! proxy launches; workers share it read-only to resolve callbacks.

use crate::config::CommandFn;
use crate::error::Error;
use crate::types::{Access, AuthLevel, MAX_CATEGORY_LENGTH, MAX_COMMAND_LENGTH};
use std::collections::HashMap;
use tracing::warn;

/// An immutable command category: access policy plus its command map and
/// scheduler parameters.
pub(crate) struct Category {
    pub access: Access,
    pub commands: HashMap<String, CommandFn>,
    pub reserved_threads: usize,
    pub max_queue: i32,
}

/// Why a category refused a command from a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessDenial {
    InsufficientAuth {
        required: AuthLevel,
        actual: AuthLevel,
    },
    RemoteNotServiceNode,
    LocalNotServiceNode,
}

impl Category {
    pub fn check_access(
        &self,
        peer_auth: AuthLevel,
        peer_sn: bool,
        local_sn: bool,
    ) -> Result<(), AccessDenial> {
        if self.access.auth > peer_auth {
            return Err(AccessDenial::InsufficientAuth {
                required: self.access.auth,
                actual: peer_auth,
            });
        }
        if self.access.remote_sn && !peer_sn {
            return Err(AccessDenial::RemoteNotServiceNode);
        }
        if self.access.local_sn && !local_sn {
            return Err(AccessDenial::LocalNotServiceNode);
        }
        Ok(())
    }
}

/// A successfully resolved command.
pub(crate) struct Resolved<'r> {
    pub category_name: &'r str,
    pub command_name: &'r str,
    pub category: &'r Category,
    pub callback: &'r CommandFn,
}

/// Outcome of [`Registry::resolve`].
pub(crate) enum Lookup<'r> {
    Found(Resolved<'r>),
    /// The name had no `category.command` structure.
    NoSeparator,
    UnknownCategory,
    UnknownCommand,
}

#[derive(Default)]
pub(crate) struct Registry {
    categories: HashMap<String, Category>,
    aliases: HashMap<String, String>,
}

impl Registry {
    pub fn add_category(
        &mut self,
        name: &str,
        access: Access,
        reserved_threads: usize,
        max_queue: i32,
    ) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_CATEGORY_LENGTH || name.contains('.') || name == "*"
        {
            return Err(Error::InvalidCategoryName(name.to_owned()));
        }
        if self.categories.contains_key(name) {
            return Err(Error::Duplicate(name.to_owned()));
        }
        self.categories.insert(
            name.to_owned(),
            Category {
                access,
                commands: HashMap::new(),
                reserved_threads,
                max_queue,
            },
        );
        Ok(())
    }

    pub fn add_command(
        &mut self,
        category: &str,
        name: &str,
        callback: CommandFn,
    ) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_COMMAND_LENGTH {
            return Err(Error::InvalidCommandName(name.to_owned()));
        }
        let cat = self
            .categories
            .get_mut(category)
            .ok_or_else(|| Error::UnknownCategory(category.to_owned()))?;
        if cat.commands.contains_key(name) {
            return Err(Error::Duplicate(format!("{category}.{name}")));
        }
        cat.commands.insert(name.to_owned(), callback);
        Ok(())
    }

    /// Adds a `from -> to` rename applied before category lookup. Access
    /// permissions follow the `to` name. The `from` side is allowed to name a
    /// category that was never registered (older wire names), with a warning.
    pub fn add_alias(&mut self, from: &str, to: &str) -> Result<(), Error> {
        let to_category = to
            .split_once('.')
            .map(|(cat, _)| cat)
            .ok_or_else(|| Error::InvalidCommandName(to.to_owned()))?;
        if !self.categories.contains_key(to_category) {
            return Err(Error::UnknownCategory(to_category.to_owned()));
        }
        if self.aliases.contains_key(from) {
            return Err(Error::Duplicate(from.to_owned()));
        }
        match from.split_once('.') {
            Some((cat, _)) if self.categories.contains_key(cat) => {}
            _ => warn!(alias = from, "alias source is not inside a registered category"),
        }
        self.aliases.insert(from.to_owned(), to.to_owned());
        Ok(())
    }

    /// Resolves a raw wire command name to its callback, applying the alias
    /// table exactly once.
    pub fn resolve<'r>(&'r self, raw: &'r str) -> Lookup<'r> {
        let name = if self.aliases.is_empty() {
            raw
        } else {
            self.aliases.get(raw).map_or(raw, String::as_str)
        };
        let Some((category_name, command_name)) = name.split_once('.') else {
            return Lookup::NoSeparator;
        };
        if category_name.is_empty() || command_name.is_empty() {
            return Lookup::NoSeparator;
        }
        let Some((category_name, category)) = self.categories.get_key_value(category_name) else {
            return Lookup::UnknownCategory;
        };
        let Some((command_name, callback)) = category.commands.get_key_value(command_name) else {
            return Lookup::UnknownCommand;
        };
        Lookup::Found(Resolved {
            category_name,
            command_name,
            category,
            callback,
        })
    }

    /// Looks up a callback for a job a worker received. The proxy only
    /// dispatches resolved commands, so this is a plain map walk.
    pub fn callback(&self, category: &str, command: &str) -> Option<&CommandFn> {
        self.categories.get(category)?.commands.get(command)
    }

    /// Category names with their reserved-thread and queue-bound parameters,
    /// consumed by the worker pool at start.
    pub fn scheduler_params(&self) -> impl Iterator<Item = (&str, usize, i32)> {
        self.categories
            .iter()
            .map(|(name, c)| (name.as_str(), c.reserved_threads, c.max_queue))
    }

    pub fn reserved_total(&self) -> usize {
        self.categories.values().map(|c| c.reserved_threads).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop() -> CommandFn {
        Arc::new(|_msg| {})
    }

    fn registry_with(cat: &str) -> Registry {
        let mut reg = Registry::default();
        reg.add_category(cat, Access::default(), 0, 200).unwrap();
        reg
    }

    #[test]
    fn category_name_rules_are_enforced() {
        let mut reg = Registry::default();
        assert!(matches!(
            reg.add_category("", Access::default(), 0, 200),
            Err(Error::InvalidCategoryName(_))
        ));
        assert!(reg
            .add_category(&"x".repeat(51), Access::default(), 0, 200)
            .is_err());
        assert!(reg
            .add_category("has.dot", Access::default(), 0, 200)
            .is_err());
        assert!(reg.add_category("*", Access::default(), 0, 200).is_err());
        assert!(reg
            .add_category(&"x".repeat(50), Access::default(), 0, 200)
            .is_ok());
    }

    #[test]
    fn duplicate_category_is_rejected() {
        let mut reg = registry_with("rpc");
        assert!(matches!(
            reg.add_category("rpc", Access::default(), 0, 200),
            Err(Error::Duplicate(_))
        ));
    }

    #[test]
    fn command_requires_existing_category() {
        let mut reg = Registry::default();
        assert!(matches!(
            reg.add_command("rpc", "ping", noop()),
            Err(Error::UnknownCategory(_))
        ));
    }

    #[test]
    fn command_name_length_is_enforced() {
        let mut reg = registry_with("rpc");
        assert!(reg.add_command("rpc", &"c".repeat(201), noop()).is_err());
        assert!(reg.add_command("rpc", &"c".repeat(200), noop()).is_ok());
    }

    #[test]
    fn resolve_finds_registered_command() {
        let mut reg = registry_with("rpc");
        reg.add_command("rpc", "ping", noop()).unwrap();
        match reg.resolve("rpc.ping") {
            Lookup::Found(r) => {
                assert_eq!(r.category_name, "rpc");
                assert_eq!(r.command_name, "ping");
            }
            _ => panic!("expected resolution"),
        }
    }

    #[test]
    fn resolve_reports_missing_pieces() {
        let mut reg = registry_with("rpc");
        reg.add_command("rpc", "ping", noop()).unwrap();
        assert!(matches!(reg.resolve("noseparator"), Lookup::NoSeparator));
        assert!(matches!(reg.resolve("rpc."), Lookup::NoSeparator));
        assert!(matches!(reg.resolve(".ping"), Lookup::NoSeparator));
        assert!(matches!(reg.resolve("other.ping"), Lookup::UnknownCategory));
        assert!(matches!(reg.resolve("rpc.pong"), Lookup::UnknownCommand));
    }

    #[test]
    fn alias_is_applied_exactly_once_and_follows_target_access() {
        let mut reg = Registry::default();
        reg.add_category(
            "dog",
            Access {
                auth: AuthLevel::Basic,
                ..Access::default()
            },
            0,
            200,
        )
        .unwrap();
        reg.add_command("dog", "bark", noop()).unwrap();
        // A second alias hop must not be followed.
        reg.add_alias("cat.meow", "dog.bark").unwrap();
        reg.add_alias("dog.bark2", "dog.bark").unwrap();

        match reg.resolve("cat.meow") {
            Lookup::Found(r) => {
                assert_eq!(r.category_name, "dog");
                assert_eq!(r.command_name, "bark");
                assert_eq!(r.category.access.auth, AuthLevel::Basic);
            }
            _ => panic!("alias should resolve"),
        }
    }

    #[test]
    fn alias_target_category_must_exist() {
        let mut reg = registry_with("rpc");
        assert!(matches!(
            reg.add_alias("old.ping", "gone.ping"),
            Err(Error::UnknownCategory(_))
        ));
        assert!(matches!(
            reg.add_alias("old.ping", "nodot"),
            Err(Error::InvalidCommandName(_))
        ));
    }

    #[test]
    fn access_check_truth_table() {
        let cat = Category {
            access: Access {
                auth: AuthLevel::Basic,
                remote_sn: true,
                local_sn: true,
            },
            commands: HashMap::new(),
            reserved_threads: 0,
            max_queue: 200,
        };
        assert!(cat.check_access(AuthLevel::Admin, true, true).is_ok());
        assert!(matches!(
            cat.check_access(AuthLevel::None, true, true),
            Err(AccessDenial::InsufficientAuth { .. })
        ));
        assert!(matches!(
            cat.check_access(AuthLevel::Basic, false, true),
            Err(AccessDenial::RemoteNotServiceNode)
        ));
        assert!(matches!(
            cat.check_access(AuthLevel::Basic, true, false),
            Err(AccessDenial::LocalNotServiceNode)
        ));
    }

    #[test]
    fn scheduler_params_reflect_registration() {
        let mut reg = Registry::default();
        reg.add_category("slow", Access::default(), 2, 8).unwrap();
        reg.add_category("fast", Access::default(), 0, -1).unwrap();
        assert_eq!(reg.reserved_total(), 2);
        let params: std::collections::HashMap<_, _> = reg
            .scheduler_params()
            .map(|(n, r, q)| (n.to_owned(), (r, q)))
            .collect();
        assert_eq!(params["slow"], (2, 8));
        assert_eq!(params["fast"], (0, -1));
    }
}
