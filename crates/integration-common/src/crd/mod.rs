//! Custom Resource Definitions for the integration operator

mod deferred_resource;
mod interface;
mod plug;
mod shared;
mod socket;
mod sources;
mod types;

pub use deferred_resource::{DeferredResource, DeferredResourceSpec, DeferredResourceStatus};
pub use interface::{Interface, InterfaceSpec, SideProperties};
pub use plug::{CoupledResultStatus, Plug, PlugSpec, PlugStatus};
pub use shared::{
    CoupledRef, Do, FieldRef, NamespacedName, Resource, ResourceAction, SchemaProperties,
    SchemaProperty, SpecApparatus, Target, Var, When,
};
pub use socket::{coupled_plugs_message, Socket, SocketSpec, SocketStatus, SocketValidation};
pub use sources::{CouplingSources, MapSources};
pub use types::{
    find_condition, reason, remove_condition, set_condition, Condition, ConditionStatus, Phase,
    CONDITION_FAILED, CONDITION_JOINED, CONDITION_RESOLVED,
};
