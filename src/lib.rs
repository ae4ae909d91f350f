//! MySqlStream.
//!
//! This crate provides an asynchronous client for the MySQL client/server
//! protocol, letting you drive connections, queries and prepared
//! statements without the overhead of higher-level abstractions.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** via [`ConnectionConfig`] and
//!   [`Connection::connect`], covering the handshake and native-password
//!   authentication (auth switch requests included)
//! - **Query execution** through [`Connection::send_query`] (text
//!   protocol) and [`Connection::send_prepared_statement`] (binary
//!   protocol with server-side statements)
//! - **Packet framing** handled by [`MySqlCodec`], which owns the
//!   sequence counter and the per-command decode state
//!
//! Each connection runs its protocol state machine on a dedicated driver
//! task; server messages are processed strictly in wire order, and at
//! most one query is in flight at a time. A second query issued while
//! one is running fails immediately rather than queueing.
//!
//! # Example: Simple Query
//!
//! ```no_run
//! use mysql_stream::{Connection, ConnectionConfig};
//!
//! # async fn example() -> mysql_stream::Result<()> {
//! let config = ConnectionConfig::new("app")
//!     .host("localhost")
//!     .password("secret")
//!     .database("mydb");
//!
//! let conn = Connection::connect(config).await?;
//!
//! let result = conn.send_query("SELECT id, name FROM users").await?;
//! for row in result.result_set().into_iter().flat_map(|rs| rs.rows()) {
//!     println!("{:?} {:?}", row.get(0), row.get(1));
//! }
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Prepared Statements
//!
//! ```no_run
//! # use mysql_stream::{Connection, Value};
//! # async fn example(conn: Connection) -> mysql_stream::Result<()> {
//! let result = conn
//!     .send_prepared_statement(
//!         "INSERT INTO users (name, age) VALUES (?, ?)",
//!         vec![Value::from("alice"), Value::from(30i32)],
//!     )
//!     .await?;
//! assert_eq!(result.affected_rows, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Transactions
//!
//! ```no_run
//! # use mysql_stream::Connection;
//! # async fn example(conn: Connection) -> mysql_stream::Result<()> {
//! conn.in_transaction(|conn| async move {
//!     conn.send_query("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
//!         .await?;
//!     conn.send_query("UPDATE accounts SET balance = balance + 10 WHERE id = 2")
//!         .await?;
//!     Ok(())
//! })
//! .await
//! # }
//! ```
//!
//! # Timeouts
//!
//! Setting [`ConnectionConfig::query_timeout`] arms a one-shot deadline
//! per query. A query that outlives its deadline fails with
//! [`Error::TimedOut`] and the connection is torn down, since the
//! protocol offers no way to abandon an in-flight command on a shared
//! session.
//!
//! # Authentication
//!
//! Currently supported: `mysql_native_password`, directly or through an
//! auth switch request. Servers demanding other plugins (for example
//! `caching_sha2_password` without a native fallback) fail the connect.
//!
//! # TLS Support
//!
//! The configuration carries an [`SslPolicy`] for a TLS collaborator to
//! act on; this crate does not negotiate TLS itself.
//!
//! # Logging
//!
//! The crate emits [`tracing`] events (unexpected frames are logged at
//! `warn` and dropped) and never installs a subscriber.

mod auth;
mod codec;
mod config;
mod connection;
mod error;
pub mod messages;
mod resultset;
mod types;
mod wire;

pub use codec::MySqlCodec;
pub use config::{ConnectionConfig, SslPolicy, charset};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use messages::backend::ServerVersion;
pub use resultset::{QueryResult, ResultSet, Row};
pub use types::{ColumnDefinition, FieldType, Value};
