//! Commands and Command Types
//!
//! A command type's applicable handler targets are declared up front: the
//! type itself, the capabilities it lists in [`Command::capabilities`]
//! (nearest first), and finally [`AnyCommand`]. Resolution looks handlers
//! up against that list; nothing walks a type hierarchy at runtime.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a command type or capability.
///
/// Capabilities are usually marker types or trait objects:
/// `CommandType::of::<dyn UserCommand>()`.
#[derive(Clone, Copy)]
pub struct CommandType {
    id: TypeId,
    name: &'static str,
}

impl CommandType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for CommandType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CommandType {}

impl Hash for CommandType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Downcasting support for trait objects.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A mutation dispatched through the [`Commander`](super::Commander).
pub trait Command: AsAny + fmt::Debug {
    /// Capabilities this command type has, nearest first.
    ///
    /// Handlers registered for any of them apply to this command.
    fn capabilities() -> Vec<CommandType>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// Root capability every command has. Handlers targeting it see every
/// command, after all more specific handlers of the same priority.
#[derive(Debug, Clone, Copy)]
pub struct AnyCommand;

/// A command type with its full capability closure.
#[derive(Debug, Clone)]
pub struct CommandTypeInfo {
    command: CommandType,
    /// Each applicable target with its distance from `command`.
    closure: Vec<(CommandType, usize)>,
}

impl CommandTypeInfo {
    pub fn of<C: Command>() -> Self {
        Self::new(CommandType::of::<C>(), C::capabilities())
    }

    /// Build the closure by hand, for commands only known at runtime.
    pub fn new(command: CommandType, capabilities: Vec<CommandType>) -> Self {
        let mut closure = vec![(command, 0)];
        for capability in capabilities {
            if !closure.iter().any(|(known, _)| *known == capability) {
                closure.push((capability, closure.len()));
            }
        }
        let root = CommandType::of::<AnyCommand>();
        if !closure.iter().any(|(known, _)| *known == root) {
            closure.push((root, closure.len()));
        }
        Self { command, closure }
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    /// Distance from the command type to `target`, if `target` applies.
    pub fn distance(&self, target: &CommandType) -> Option<usize> {
        self.closure
            .iter()
            .find(|(known, _)| known == target)
            .map(|(_, distance)| *distance)
    }

    pub fn closure(&self) -> &[(CommandType, usize)] {
        &self.closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait UserCommand {}

    #[derive(Debug)]
    struct RenameUser;

    impl UserCommand for RenameUser {}

    impl Command for RenameUser {
        fn capabilities() -> Vec<CommandType> {
            vec![CommandType::of::<dyn UserCommand>()]
        }
    }

    #[test]
    fn closure_lists_self_capabilities_then_root() {
        let info = CommandTypeInfo::of::<RenameUser>();
        assert_eq!(info.distance(&CommandType::of::<RenameUser>()), Some(0));
        assert_eq!(info.distance(&CommandType::of::<dyn UserCommand>()), Some(1));
        assert_eq!(info.distance(&CommandType::of::<AnyCommand>()), Some(2));
        assert_eq!(info.distance(&CommandType::of::<u32>()), None);
    }

    #[test]
    fn duplicate_capabilities_are_ignored() {
        let info = CommandTypeInfo::new(
            CommandType::of::<RenameUser>(),
            vec![
                CommandType::of::<dyn UserCommand>(),
                CommandType::of::<dyn UserCommand>(),
                CommandType::of::<AnyCommand>(),
            ],
        );
        assert_eq!(info.closure().len(), 3);
    }

    #[test]
    fn commands_downcast_through_arc() {
        let command: Arc<dyn Command> = Arc::new(RenameUser);
        let any = AsAny::into_any(command);
        assert!(any.downcast::<RenameUser>().is_ok());
    }
}
