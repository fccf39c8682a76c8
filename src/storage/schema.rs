//! Inventory and result records the control plane reads and writes
//!
//! These are plain serde structs. The SQLite backend stores each record as a
//! JSON document keyed by its id, the memory backend keeps them in maps.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::proto::{DbConnection, LocationConfig};

/// Kinds of agents known to the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// The supervising agent that holds the connection to the hub
    PmmAgent,
    NodeExporter,
    MysqldExporter,
    MongodbExporter,
    PostgresExporter,
    QanMysqlPerfschema,
    QanMongodbProfiler,
    QanPostgresqlPgstatements,
}

impl AgentType {
    /// Query-analytics agents run inside the supervising agent instead of
    /// as a separate process.
    pub fn is_builtin(&self) -> bool {
        matches!(
            self,
            AgentType::QanMysqlPerfschema
                | AgentType::QanMongodbProfiler
                | AgentType::QanPostgresqlPgstatements
        )
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentType::PmmAgent => "pmm-agent",
            AgentType::NodeExporter => "node_exporter",
            AgentType::MysqldExporter => "mysqld_exporter",
            AgentType::MongodbExporter => "mongodb_exporter",
            AgentType::PostgresExporter => "postgres_exporter",
            AgentType::QanMysqlPerfschema => "qan-mysql-perfschema-agent",
            AgentType::QanMongodbProfiler => "qan-mongodb-profiler-agent",
            AgentType::QanPostgresqlPgstatements => "qan-postgresql-pgstatements-agent",
        };
        write!(f, "{s}")
    }
}

/// Runtime status reported by agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Waiting,
    Stopping,
    Done,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Mysql,
    Mongodb,
    Postgresql,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceType::Mysql => "mysql",
            ServiceType::Mongodb => "mongodb",
            ServiceType::Postgresql => "postgresql",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: AgentType,

    /// Supervising agent this one is run by
    #[serde(default)]
    pub pmm_agent_id: Option<String>,

    /// Node a supervising agent runs on
    #[serde(default)]
    pub runs_on_node_id: Option<String>,

    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub service_id: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub status: Option<AgentStatus>,

    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Extra command line flags for exporter processes
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            pmm_agent_id: None,
            runs_on_node_id: None,
            node_id: None,
            service_id: None,
            version: None,
            disabled: false,
            status: None,
            listen_port: None,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_id: String,
    pub service_type: ServiceType,
    pub name: String,
    pub node_id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub socket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl ServiceRecord {
    pub fn db_connection(&self, credentials: &ServiceCredentials) -> DbConnection {
        DbConnection {
            user: credentials.username.clone(),
            password: credentials.password.clone(),
            address: self.address.clone().unwrap_or_default(),
            port: self.port.unwrap_or_default(),
            socket: self.socket.clone().unwrap_or_default(),
        }
    }
}

/// Latest known state of an action run on an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub pmm_agent_id: String,
    pub done: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Echo,
    MysqlBackup,
    MongodbBackup,
    MysqlRestoreBackup,
    MongodbRestoreBackup,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Echo => "echo",
            JobType::MysqlBackup => "mysql_backup",
            JobType::MongodbBackup => "mongodb_backup",
            JobType::MysqlRestoreBackup => "mysql_restore_backup",
            JobType::MongodbRestoreBackup => "mongodb_restore_backup",
        };
        write!(f, "{s}")
    }
}

/// Type specific job data kept so a job can be restarted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobData {
    Echo {
        message: String,
        delay: Duration,
    },
    MysqlBackup {
        service_id: String,
        artifact_id: String,
    },
    MongodbBackup {
        service_id: String,
        artifact_id: String,
    },
    MysqlRestoreBackup {
        service_id: String,
        restore_id: String,
    },
    MongodbRestoreBackup {
        service_id: String,
        restore_id: String,
    },
}

impl JobData {
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::Echo { .. } => JobType::Echo,
            JobData::MysqlBackup { .. } => JobType::MysqlBackup,
            JobData::MongodbBackup { .. } => JobType::MongodbBackup,
            JobData::MysqlRestoreBackup { .. } => JobType::MysqlRestoreBackup,
            JobData::MongodbRestoreBackup { .. } => JobType::MongodbRestoreBackup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub pmm_agent_id: String,
    pub data: JobData,
    pub timeout: Duration,
    pub retries_remaining: u32,
    pub interval: Duration,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.data.job_type()
    }
}

/// One chunk of job output streamed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_id: String,
    pub chunk_id: u32,
    pub data: String,
    pub last_chunk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub location_id: String,
    pub vendor: ServiceType,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupLocation {
    pub id: String,
    pub name: String,
    pub config: LocationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    InProgress,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreHistoryItem {
    pub id: String,
    pub artifact_id: String,
    pub service_id: String,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}
