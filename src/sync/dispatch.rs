//! Command dispatch registry
//!
//! Handlers are registered with a table of named callbacks taking the command
//! parameter as their only argument. Bindings then tie a command name to one
//! `(handler, method)` pair. Dispatch is a linear scan over the bindings in
//! registration order and invokes **every** complete binding whose command name
//! matches, so two bindings for `jump` both fire.
//!
//! ```text
//! "</>command;;</>jump;</>up"
//!        │ decode
//!        ▼
//!   Command { name: "jump", parameter: "up" }
//!        │ scan bindings
//!        ▼
//!   (player, on_jump, jump) ──► player.methods["on_jump"]("up")
//! ```

use super::command::{is_valid_command_name, Command};
use super::error::SyncError;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Callback invoked with the decoded command parameter
pub type MethodFn = Box<dyn FnMut(&str) + Send>;

/// Identity of a handler object, e.g. the name of the game object owning it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub String);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(value: &str) -> Self {
        HandlerId(value.to_string())
    }
}

/// A dispatch target exposing named one-argument methods
pub struct Handler {
    id: HandlerId,
    methods: HashMap<String, MethodFn>,
}

impl Handler {
    pub fn new(id: impl Into<HandlerId>) -> Self {
        Self {
            id: id.into(),
            methods: HashMap::new(),
        }
    }

    /// Adds a named method; a later method with the same name replaces the earlier one
    pub fn with_method<F>(mut self, name: &str, method: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(method));
        self
    }

    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    /// Method names, sorted for stable presentation in configuration tooling
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// `(handler, method, command)` triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandBinding {
    pub handler: HandlerId,
    pub method: String,
    pub command: String,
}

impl CommandBinding {
    pub fn new(handler: impl Into<HandlerId>, method: &str, command: &str) -> Self {
        Self {
            handler: handler.into(),
            method: method.to_string(),
            command: command.to_string(),
        }
    }

    /// Bindings missing a method or command name are kept but never dispatched
    pub fn is_complete(&self) -> bool {
        !self.method.is_empty() && !self.command.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    Ready,
    Incomplete,
    TargetMissing,
}

/// Registry of handlers and the bindings pointing into them
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<HandlerId, Handler>,
    bindings: Vec<CommandBinding>,
    log_events: bool,
}

impl Dispatcher {
    pub fn new(log_events: bool) -> Self {
        Self {
            log_events,
            ..Self::default()
        }
    }

    /// Adds or replaces a handler; existing bindings to its id resolve against the new one
    pub fn add_handler(&mut self, handler: Handler) {
        debug!("Registering handler '{}'", handler.id);
        if self.handlers.insert(handler.id.clone(), handler).is_some() {
            debug!("Replaced existing handler");
        }
    }

    /// Drops a handler; bindings to it stay and report `TargetMissing`
    pub fn remove_handler(&mut self, id: &HandlerId) -> Option<Handler> {
        let removed = self.handlers.remove(id);
        if removed.is_some() {
            debug!("Removed handler '{}'", id);
        }
        removed
    }

    /// Methods of a live handler that a binding can select
    pub fn selectable_methods(&self, id: &HandlerId) -> Vec<String> {
        self.handlers
            .get(id)
            .map(Handler::method_names)
            .unwrap_or_default()
    }

    pub fn register_binding(&mut self, binding: CommandBinding) -> Result<(), SyncError> {
        if !binding.command.is_empty() && !is_valid_command_name(&binding.command) {
            return Err(SyncError::InvalidCommand(format!(
                "command name '{}' must match [a-zA-Z0-9]+",
                binding.command
            )));
        }

        if self.bindings.contains(&binding) {
            warn!(
                "Rejected duplicate binding {}.{} -> {}",
                binding.handler, binding.method, binding.command
            );
            return Err(SyncError::DuplicateBinding {
                handler: binding.handler.0,
                method: binding.method,
                command: binding.command,
            });
        }

        match self.binding_status(&binding) {
            BindingStatus::Ready => debug!(
                "Bound {}.{} to command '{}'",
                binding.handler, binding.method, binding.command
            ),
            BindingStatus::Incomplete => {
                debug!("Stored incomplete binding for '{}'", binding.handler)
            }
            BindingStatus::TargetMissing => warn!(
                "Binding {}.{} points to a missing target",
                binding.handler, binding.method
            ),
        }

        self.bindings.push(binding);
        Ok(())
    }

    /// Removes the identical triple; returns whether one was present
    pub fn unregister_binding(&mut self, binding: &CommandBinding) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b != binding);
        before != self.bindings.len()
    }

    pub fn bindings(&self) -> &[CommandBinding] {
        &self.bindings
    }

    pub fn binding_status(&self, binding: &CommandBinding) -> BindingStatus {
        if !binding.is_complete() {
            return BindingStatus::Incomplete;
        }
        match self.handlers.get(&binding.handler) {
            Some(handler) if handler.methods.contains_key(&binding.method) => BindingStatus::Ready,
            _ => BindingStatus::TargetMissing,
        }
    }

    /// Invokes every complete binding for the command; returns how many ran
    pub fn dispatch(&mut self, command: &Command) -> usize {
        let mut invoked = 0;

        for binding in self
            .bindings
            .iter()
            .filter(|b| b.is_complete() && b.command == command.name)
        {
            let method = self
                .handlers
                .get_mut(&binding.handler)
                .and_then(|handler| handler.methods.get_mut(&binding.method));

            match method {
                Some(method) => {
                    method(&command.parameter);
                    invoked += 1;
                    if self.log_events {
                        info!(
                            "Received command {} with parameter {}",
                            command.name,
                            command.parameter
                        );
                    }
                }
                None => {
                    let err = SyncError::DispatchTargetMissing {
                        handler: binding.handler.0.clone(),
                        method: binding.method.clone(),
                    };
                    error!("{}", err);
                }
            }
        }

        if invoked == 0 {
            debug!("No binding handled command '{}'", command.name);
        }
        invoked
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("bindings", &self.bindings)
            .finish()
    }
}
