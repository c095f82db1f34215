//! rowguard: request-scoped tenant and branch isolation for pooled Postgres
//! connections, enforced by row-level security.

pub mod admin;
pub mod binder;
pub mod catalog;
pub mod config;
pub mod context;
mod error;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod protected;
pub mod schema;
pub mod scope;
pub mod store;
pub mod testing;
pub mod tools;
pub mod validator;
pub mod verify;

pub use binder::{BoundContext, ContextBinder, ContextState};
pub use config::{Config, Deployment};
pub use context::{Candidate, CandidateSource, HostMapping, Principal, RequestParts};
pub use error::{Error, RejectionKind, Result, WithContext};
pub use schema::{SchemaConfig, SchemaPlan};
pub use scope::{Branch, NewScope, Scope, ScopeKind, Tenant};
pub use store::{RoutePolicy, Store, StoreBuilder};

pub mod prelude {
    pub use crate::{
        Branch, BoundContext, Error, RequestParts, Result, RoutePolicy, Scope, ScopeKind, Store,
        Tenant,
    };
}
