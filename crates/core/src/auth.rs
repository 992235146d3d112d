//! RTSP Digest authentication (RFC 2617 with MD5 and no `qop`, as RTSP
//! clients implement it).

use std::collections::HashMap;

use md5::{Digest, Md5};

/// Username/password table consulted for every protected request.
#[derive(Debug, Clone)]
pub struct AuthDatabase {
    realm: String,
    users: HashMap<String, String>,
}

/// Parameters of an `Authorization: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl AuthDatabase {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            users: HashMap::new(),
        }
    }

    pub fn with_users<'a>(realm: &str, users: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut db = Self::new(realm);
        for (name, password) in users {
            db.add_user(name, password);
        }
        db
    }

    pub fn add_user(&mut self, name: &str, password: &str) {
        self.users.insert(name.to_string(), password.to_string());
    }

    /// `WWW-Authenticate` value for a 401 carrying `nonce`.
    pub fn challenge(&self, nonce: &str) -> String {
        format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, nonce)
    }

    /// Check an `Authorization` header against the nonce most recently
    /// issued on the connection. Returns the authenticated user.
    pub fn verify(&self, authorization: Option<&str>, method: &str, nonce: Option<&str>) -> Option<String> {
        let nonce = nonce?;
        let credentials = parse_authorization(authorization?)?;
        if credentials.nonce != nonce || credentials.realm != self.realm {
            tracing::debug!(user = %credentials.username, "stale nonce or wrong realm");
            return None;
        }
        let password = self.users.get(&credentials.username)?;
        let expected = digest_response(
            &credentials.username,
            password,
            &self.realm,
            nonce,
            method,
            &credentials.uri,
        );
        if expected.eq_ignore_ascii_case(&credentials.response) {
            Some(credentials.username)
        } else {
            tracing::debug!(user = %credentials.username, "digest response mismatch");
            None
        }
    }
}

/// Fresh random nonce: 128 bits as hex.
pub fn new_nonce() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// `MD5(MD5(user:realm:pass):nonce:MD5(method:uri))`, lower-case hex.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

pub fn parse_authorization(header_value: &str) -> Option<DigestCredentials> {
    let trimmed = header_value.trim();
    let (scheme, params) = trimmed.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }
    let mut username = None;
    let mut realm = None;
    let mut nonce = None;
    let mut uri = None;
    let mut response = None;

    for part in split_params(params) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "username" => username = Some(value),
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "uri" => uri = Some(value),
            "response" => response = Some(value),
            _ => {}
        }
    }

    Some(DigestCredentials {
        username: username?,
        realm: realm?,
        nonce: nonce?,
        uri: uri?,
        response: response?,
    })
}

fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        }
        if ch == ',' && !in_quotes {
            parts.push(input[start..idx].trim());
            start = idx + 1;
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> AuthDatabase {
        AuthDatabase::with_users("LIVE", [("alice", "secret")])
    }

    fn header(response: &str, nonce: &str) -> String {
        format!(
            "Digest username=\"alice\", realm=\"LIVE\", nonce=\"{}\", uri=\"rtsp://h/a.264\", response=\"{}\"",
            nonce, response
        )
    }

    #[test]
    fn known_digest_vector() {
        // RFC 2617 §3.5 without qop.
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn accepts_matching_response() {
        let nonce = new_nonce();
        let response = digest_response("alice", "secret", "LIVE", &nonce, "DESCRIBE", "rtsp://h/a.264");
        assert_eq!(
            db().verify(Some(&header(&response, &nonce)), "DESCRIBE", Some(&nonce)),
            Some("alice".to_string())
        );
    }

    #[test]
    fn rejects_wrong_password_method_or_nonce() {
        let nonce = new_nonce();
        let bad = digest_response("alice", "guess", "LIVE", &nonce, "DESCRIBE", "rtsp://h/a.264");
        assert_eq!(db().verify(Some(&header(&bad, &nonce)), "DESCRIBE", Some(&nonce)), None);

        let good = digest_response("alice", "secret", "LIVE", &nonce, "DESCRIBE", "rtsp://h/a.264");
        assert_eq!(db().verify(Some(&header(&good, &nonce)), "PLAY", Some(&nonce)), None);
        assert_eq!(db().verify(Some(&header(&good, &nonce)), "DESCRIBE", Some("other")), None);
        assert_eq!(db().verify(Some(&header(&good, &nonce)), "DESCRIBE", None), None);
        assert_eq!(db().verify(None, "DESCRIBE", Some(&nonce)), None);
    }

    #[test]
    fn parses_quoted_commas() {
        let creds = parse_authorization(
            "Digest username=\"a,b\", realm=\"r\", nonce=\"n\", uri=\"rtsp://h/x?a=1,2\", response=\"f\"",
        )
        .unwrap();
        assert_eq!(creds.username, "a,b");
        assert_eq!(creds.uri, "rtsp://h/x?a=1,2");
        assert!(parse_authorization("Basic YWxpY2U6c2VjcmV0").is_none());
    }

    #[test]
    fn challenge_and_nonce_format() {
        let nonce = new_nonce();
        assert_eq!(nonce.len(), 32);
        assert_ne!(nonce, new_nonce());
        assert_eq!(db().challenge("abc"), "Digest realm=\"LIVE\", nonce=\"abc\"");
    }
}
