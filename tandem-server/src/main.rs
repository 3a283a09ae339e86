//! Standalone sync server.
//!
//! ```text
//! tandem-server --bind 0.0.0.0:9090 --record-type shape:x=number,y=number --record-type page
//! ```
//!
//! A record type is `NAME` or `NAME:FIELD=KIND,...`, where KIND is one of
//! string, number, bool, object, array or any.
//!
//! Clients connect to `ws://<bind>/<document_id>?sessionKey=<key>`.

use std::time::Duration;

use clap::Parser;
use log::info;
use tandem_sync::{FieldKind, RecordType, RoomConfig, Schema, ServerConfig, ServerError, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "tandem-server", version, about = "Real-time multiplayer sync rooms")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TANDEM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Schema version this server speaks
    #[arg(long, default_value_t = 1)]
    schema_version: u32,

    /// Oldest client schema version still accepted
    #[arg(long)]
    min_schema_version: Option<u32>,

    /// Document record type to accept, with optional required fields (repeatable)
    #[arg(long = "record-type", value_name = "NAME[:FIELD=KIND,...]", value_parser = parse_record_type)]
    record_types: Vec<RecordType>,

    /// Connected sessions allowed per room
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Room sweep interval in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

fn parse_record_type(s: &str) -> Result<RecordType, String> {
    let (name, fields) = match s.split_once(':') {
        Some((name, fields)) => (name, Some(fields)),
        None => (s, None),
    };
    if name.is_empty() {
        return Err("record type name must not be empty".to_string());
    }
    let record_type = RecordType::document(name);
    let Some(fields) = fields else {
        return Ok(record_type);
    };
    fields.split(',').try_fold(record_type, |record_type, field| -> Result<RecordType, String> {
        let (field, kind) = field
            .split_once('=')
            .ok_or_else(|| format!("field '{field}' must be written as FIELD=KIND"))?;
        if field.is_empty() {
            return Err(format!("empty field name in '{s}'"));
        }
        Ok(record_type.field(field, kind.parse::<FieldKind>()?))
    })
}

impl Args {
    fn schema(&self) -> Schema {
        let schema = Schema::new(self.schema_version)
            .with_min_supported(self.min_schema_version.unwrap_or(self.schema_version));
        self.record_types
            .iter()
            .cloned()
            .fold(schema, |schema, record_type| schema.with_type(record_type))
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            room: RoomConfig {
                max_sessions: self.max_sessions,
                ..RoomConfig::default().with_schema(self.schema())
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = args.server_config();
    let names: Vec<&str> = args.record_types.iter().map(|t| t.name.as_str()).collect();
    info!(
        "Starting tandem server (schema v{}, record types: {:?})",
        args.schema_version, names
    );
    SyncServer::new(config).run().await
}
