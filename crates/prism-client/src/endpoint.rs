// SPDX-License-Identifier: Apache-2.0
//! Worker endpoint parsing.

use crate::SessionError;

/// Strip and validate the `tcp://` scheme, returning the `host:port`
/// authority suitable for `TcpStream::connect`.
pub(crate) fn parse_endpoint(endpoint: &str) -> Result<&str, SessionError> {
    let authority = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| SessionError::BadEndpoint {
            endpoint: endpoint.to_string(),
        })?;
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| SessionError::BadEndpoint {
            endpoint: endpoint.to_string(),
        })?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(SessionError::BadEndpoint {
            endpoint: endpoint.to_string(),
        });
    }
    Ok(authority)
}
