//! A compact synchronous MySQL client built around two jobs: binding typed
//! parameters into prepared statements, and materializing result rows back
//! out through a fixed type-conversion matrix.
//!
//! A session starts from an [`Account`], which validates endpoint and
//! credential settings up front. [`Connection`] speaks the text protocol
//! (`query`, `execute`, `insert`) and prepares [`Statement`]s for the
//! binary protocol. Both paths buffer their rows into a [`ResultSet`] with
//! a movable cursor, and [`Field`] handles read the current row's cells as
//! whatever type the caller asks for, NULL and empty cells reading as that
//! type's zero.
//!
//! Handles chain: a `Field` keeps its `ResultSet` alive, which keeps its
//! `Statement` and `Connection` alive. Everything is single-threaded and
//! reference-counted; none of the handles are `Send`.
//!
//! ```no_run
//! use tinymysql::Account;
//!
//! # fn main() -> tinymysql::Result<()> {
//! let mut account = Account::new();
//! account.set_host("localhost")?;
//! account.set_user("game");
//! account.set_password("secret");
//! account.set_database("game");
//!
//! let conn = account.connect()?;
//! let stmt = conn.prepare("INSERT INTO players (name, score) VALUES (?, ?)")?;
//! stmt.set_str(0, "alice")?;
//! stmt.set_u32(1, 1500)?;
//! let id = stmt.insert()?;
//! println!("new player {id}");
//!
//! let rows = conn.query("SELECT name, score FROM players")?;
//! while rows.next()? {
//!     let name = rows.field("name").get_str()?;
//!     let score = rows.field("score").get_u32()?;
//!     println!("{name}: {score}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod column;
pub mod consts;
pub mod convert;
pub mod error;
pub mod temporal;

mod conn;
mod field;
mod proto;
mod result;
mod stmt;
mod stream;
#[cfg(feature = "tls")]
mod tls;

pub use crate::account::{Account, SslOpts};
pub use crate::column::Column;
pub use crate::conn::Connection;
pub use crate::convert::FromWire;
pub use crate::error::{Error, Result, ServerError};
pub use crate::field::{Field, FieldId};
pub use crate::result::ResultSet;
pub use crate::stmt::Statement;
pub use crate::temporal::{Date, DateTime, Time};
