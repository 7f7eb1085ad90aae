//! Rendering of the files postgres reads from its data directory.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use sirenia_core::Instance;

/// Extensions allowed when the whitelist is enabled.
const EXTENSIONS: &str = "btree_gin,btree_gist,chkpass,citext,cube,dblink,dict_int,earthdistance,\
fuzzystrmatch,hstore,intarray,isn,ltree,pg_prewarm,pg_stat_statements,pg_trgm,pgcrypto,pgrouting,\
pgrowlocks,pgstattuple,plpgsql,plv8,postgis,postgis_topology,postgres_fdw,tablefunc,unaccent,uuid-ossp";

/// Role used for replication and administration.
pub const SUPERUSER: &str = "sirenia";

pub const HBA_CONF: &str = "\
# TYPE  DATABASE        USER            ADDRESS                 METHOD
host    all             postgres        127.0.0.1/32            trust
host    all             all             127.0.0.1/32            md5
host    all             all             all                     md5
host    replication     sirenia         all                     md5
";

/// Inputs to `postgresql.conf`.
#[derive(Debug, Clone, Default)]
pub struct ConfigData<'a> {
    /// Logical id, used as the log line prefix.
    pub id: &'a str,
    pub port: u16,
    /// `application_name` of the synchronous standby; empty for none.
    pub sync: &'a str,
    /// Reject write transactions by default.
    pub read_only: bool,
    pub ext_whitelist: bool,
    pub tunables: Option<&'a BTreeMap<String, String>>,
}

impl ConfigData<'_> {
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "unix_socket_directories = ''\n\
             listen_addresses = '0.0.0.0'\n\
             port = {port}\n\
             ssl = off\n\
             max_connections = 400\n\
             wal_level = hot_standby\n\
             fsync = on\n\
             synchronous_commit = remote_write\n\
             synchronous_standby_names = '{sync}'\n",
            port = self.port,
            sync = self.sync,
        );
        if self.read_only {
            out.push_str("default_transaction_read_only = on\n");
        }
        let _ = write!(
            out,
            "hot_standby = on\n\
             hot_standby_feedback = on\n\
             log_destination = 'stderr'\n\
             logging_collector = false\n\
             log_line_prefix = '{id} %m '\n",
            id = self.id,
        );
        if self.ext_whitelist {
            out.push_str("local_preload_libraries = 'pgextwlist'\n");
            let _ = writeln!(out, "extwlist.extensions = '{EXTENSIONS}'");
        }
        for (key, value) in self.tunables.into_iter().flatten() {
            let _ = writeln!(out, "{key} = {value}");
        }
        out
    }
}

/// libpq connection string for replicating from `upstream` as `application_name`.
#[must_use]
pub fn conninfo(upstream: &Instance, password: &str, application_name: &str) -> String {
    format!(
        "host={} port={} user={SUPERUSER} password={password} application_name={application_name}",
        upstream.host(),
        upstream.port(),
    )
}

/// `recovery.conf` for a standby following `primary_conninfo`.
#[must_use]
pub fn recovery_conf(primary_conninfo: &str, trigger_file: &str) -> String {
    format!(
        "standby_mode = on\n\
         primary_conninfo = '{primary_conninfo}'\n\
         trigger_file = '{trigger_file}'\n\
         recovery_target_timeline = 'latest'\n"
    )
}

/// Quote `value` as a SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
