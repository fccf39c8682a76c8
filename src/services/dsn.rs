//! Connection strings handed to agents.

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::storage::schema::{ServiceCredentials, ServiceRecord, ServiceType};

/// DSN for connecting to `service` with `credentials`.
///
/// `database` may be empty. A zero `timeout` leaves the connect timeout to
/// the driver default.
pub fn service_dsn(
    service: &ServiceRecord,
    credentials: &ServiceCredentials,
    database: &str,
    timeout: Duration,
) -> Result<String> {
    match service.service_type {
        ServiceType::Mysql => Ok(mysql_dsn(service, credentials, database, timeout)),
        ServiceType::Postgresql => {
            let database = if database.is_empty() { "postgres" } else { database };
            let mut params = vec![("sslmode", "disable".to_string())];
            if !timeout.is_zero() {
                params.push(("connect_timeout", timeout.as_secs().max(1).to_string()));
            }
            url_dsn("postgres", service, credentials, database, &params)
        }
        ServiceType::Mongodb => {
            let mut params = Vec::new();
            if !timeout.is_zero() {
                params.push(("connectTimeoutMS", timeout.as_millis().to_string()));
                params.push(("serverSelectionTimeoutMS", timeout.as_millis().to_string()));
            }
            url_dsn("mongodb", service, credentials, database, &params)
        }
    }
}

fn mysql_dsn(
    service: &ServiceRecord,
    credentials: &ServiceCredentials,
    database: &str,
    timeout: Duration,
) -> String {
    let userinfo = match (credentials.username.is_empty(), credentials.password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", credentials.username),
        (false, false) => format!("{}:{}@", credentials.username, credentials.password),
    };

    let endpoint = match &service.socket {
        Some(socket) if !socket.is_empty() => format!("unix({socket})"),
        _ => format!(
            "tcp({}:{})",
            service.address.as_deref().unwrap_or("127.0.0.1"),
            service.port.unwrap_or(3306)
        ),
    };

    let mut dsn = format!("{userinfo}{endpoint}/{database}");
    if !timeout.is_zero() {
        dsn.push_str(&format!("?timeout={}s", timeout.as_secs().max(1)));
    }
    dsn
}

fn url_dsn(
    scheme: &str,
    service: &ServiceRecord,
    credentials: &ServiceCredentials,
    database: &str,
    params: &[(&str, String)],
) -> Result<String> {
    let invalid = |e: url::ParseError| {
        Error::InvalidArgument(format!(
            "invalid address for service {:?}: {e}",
            service.service_id
        ))
    };

    let default_port = match service.service_type {
        ServiceType::Postgresql => 5432,
        ServiceType::Mongodb => 27017,
        ServiceType::Mysql => 3306,
    };

    let mut url = match &service.socket {
        Some(socket) if !socket.is_empty() => {
            let encoded: String = url::form_urlencoded::byte_serialize(socket.as_bytes()).collect();
            Url::parse(&format!("{scheme}://{encoded}/")).map_err(invalid)?
        }
        _ => Url::parse(&format!(
            "{scheme}://{}:{}/",
            service.address.as_deref().unwrap_or("127.0.0.1"),
            service.port.unwrap_or(default_port)
        ))
        .map_err(invalid)?,
    };

    if !credentials.username.is_empty() {
        // only fails for URLs without a host, which we never build
        let _ = url.set_username(&credentials.username);
        if !credentials.password.is_empty() {
            let _ = url.set_password(Some(&credentials.password));
        }
    }
    url.set_path(&format!("/{database}"));
    if !params.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    }

    Ok(url.into())
}
