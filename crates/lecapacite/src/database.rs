//! Database-admin capability
//!
//! `PsqlAdmin` issues single SQL statements through `psql -tAc`, normally as the
//! `postgres` superuser via a configurable wrapper command.

use tracing::info;

use crate::command::{with_prefix, CommandSpec, Result};

/// Administers database roles and databases.
pub trait DatabaseAdmin: Send + Sync {
    /// Whether a login role exists.
    fn role_exists(&self, name: &str) -> Result<bool>;

    /// Create a login role with a password.
    fn create_role(&self, name: &str, password: &str) -> Result<()>;

    /// Whether a database exists.
    fn database_exists(&self, name: &str) -> Result<bool>;

    /// Create a database owned by `owner`.
    fn create_database(&self, name: &str, owner: &str) -> Result<()>;

    /// Whether `role` holds full privileges on `database`.
    fn has_privileges(&self, database: &str, role: &str) -> Result<bool>;

    /// Grant `role` ownership and full privileges on `database`.
    fn grant_privileges(&self, database: &str, role: &str) -> Result<()>;

    /// Drop a database if it exists.
    fn drop_database(&self, name: &str) -> Result<()>;

    /// Drop a role if it exists.
    fn drop_role(&self, name: &str) -> Result<()>;
}

/// `psql` backed database administrator.
#[derive(Debug, Clone)]
pub struct PsqlAdmin {
    /// Wrapper such as `["sudo", "-u", "postgres"]`
    pub prefix: Vec<String>,
    /// Server host; `None` uses the local socket
    pub host: Option<String>,
    /// Server port
    pub port: Option<u16>,
}

impl Default for PsqlAdmin {
    fn default() -> Self {
        Self {
            prefix: vec!["sudo".to_string(), "-u".to_string(), "postgres".to_string()],
            host: None,
            port: None,
        }
    }
}

impl PsqlAdmin {
    fn query(&self, sql: &str) -> Result<String> {
        let mut spec = CommandSpec::new("psql").args(["-v", "ON_ERROR_STOP=1", "-tA"]);
        if let Some(host) = &self.host {
            spec = spec.args(["-h", host.as_str()]);
        }
        if let Some(port) = self.port {
            spec = spec.args(["-p".to_string(), port.to_string()]);
        }
        let output = with_prefix(&self.prefix, spec.args(["-c", sql])).run()?;
        Ok(output.stdout.trim().to_string())
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.query(sql).map(|_| ())
    }
}

/// Quote an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an SQL identifier.
pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

impl DatabaseAdmin for PsqlAdmin {
    fn role_exists(&self, name: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM pg_roles WHERE rolname = {}", quote_literal(name));
        Ok(self.query(&sql)? == "1")
    }

    fn create_role(&self, name: &str, password: &str) -> Result<()> {
        info!(role = name, "creating database role");
        self.execute(&format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            quote_ident(name),
            quote_literal(password)
        ))
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            quote_literal(name)
        );
        Ok(self.query(&sql)? == "1")
    }

    fn create_database(&self, name: &str, owner: &str) -> Result<()> {
        info!(database = name, owner, "creating database");
        self.execute(&format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(name),
            quote_ident(owner)
        ))
    }

    fn has_privileges(&self, database: &str, role: &str) -> Result<bool> {
        let sql = format!(
            "SELECT has_database_privilege({}, {}, 'CREATE, CONNECT, TEMPORARY')",
            quote_literal(role),
            quote_literal(database)
        );
        Ok(self.query(&sql)? == "t")
    }

    fn grant_privileges(&self, database: &str, role: &str) -> Result<()> {
        self.execute(&format!(
            "ALTER DATABASE {db} OWNER TO {role}",
            db = quote_ident(database),
            role = quote_ident(role)
        ))?;
        self.execute(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE {db} TO {role}",
            db = quote_ident(database),
            role = quote_ident(role)
        ))
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        info!(database = name, "dropping database");
        self.execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))
    }

    fn drop_role(&self, name: &str) -> Result<()> {
        info!(role = name, "dropping database role");
        self.execute(&format!("DROP ROLE IF EXISTS {}", quote_ident(name)))
    }
}
