//! # sqt
//!
//! Asynchronous PostgreSQL connection driver with incremental result
//! streaming.
//!
//! A connection never blocks its owner while a command runs: it asks a
//! [`watcher::SocketWatcher`] for socket readiness and advances one step per
//! readiness callback, appending decoded rows to shared result tables and
//! reporting progress as [`events::ConnectionEvent`]s.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqt::prelude::*;
//!
//! let mut conn = sqt::driver::connect(Backend::Postgres, "host=localhost user=app", "shop");
//! if conn.open() && conn.execute("select id, name from users", &[], Some(10)) {
//!     for table in conn.results().snapshot() {
//!         println!("{} rows", table.row_count());
//!     }
//! }
//! ```
//!
//! ## Execution modes
//!
//! | Mode            | Entry point                         | Thread           |
//! |-----------------|-------------------------------------|------------------|
//! | Blocking        | `DbConnection::execute`             | caller           |
//! | Cooperative     | `DbConnection::execute_async`       | caller callbacks |
//! | Offloaded       | `driver::offload::Session`          | tokio worker     |

pub mod config;
pub mod conninfo;
pub mod driver;
pub mod error;
pub mod events;
pub mod params;
pub mod protocol;
pub mod table;
pub mod types;
pub mod watcher;

pub mod prelude {
    pub use crate::conninfo::ConnectOptions;
    pub use crate::driver::{
        AsyncPhase, Backend, CancelHandle, DbConnection, PgConnection, QueryState,
    };
    pub use crate::error::*;
    pub use crate::events::ConnectionEvent;
    pub use crate::params::ParamList;
    pub use crate::table::{DataColumn, DataTable, ResultSets, TableRef};
    pub use crate::types::{PgTypeMapper, TypeMapper, Value, ValueKind};
    pub use crate::watcher::{SocketWatcher, WatchMode};

    #[cfg(unix)]
    pub use crate::driver::offload::Session;
}

pub use driver::connect;
pub use error::{SqtError, SqtResult};
