use hex::ToHex;
use http::HeaderMap;
use http::header;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Digest;

/// Secrets look like `pg_<64 lowercase hex chars>`, 67 chars total.
pub const SECRET_PREFIX: &str = "pg_";
pub const SECRET_LEN: usize = 67;

/// Length of the stored display prefix (`pg_` plus five hex chars).
pub const DISPLAY_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader,
    NotBearer,
    MalformedSecret,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingHeader => write!(f, "missing Authorization header"),
            AuthError::NotBearer => write!(f, "Authorization must be a Bearer token"),
            AuthError::MalformedSecret => write!(f, "malformed bearer secret"),
        }
    }
}

impl std::error::Error for AuthError {}

/// A freshly minted secret together with the two values the metadata store
/// persists in its place.
#[derive(Debug, Clone)]
pub struct MintedSecret {
    pub secret: String,
    pub hash: String,
    pub prefix: String,
}

/// Draw 32 bytes from the OS RNG and format them as a full secret. The OS
/// RNG panics if the platform entropy source is unavailable, which is the
/// one fatal failure mode here.
pub fn mint() -> MintedSecret {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);

    let secret = format!("{}{}", SECRET_PREFIX, hex::encode(bytes));
    let hash = hash_secret(&secret);
    let prefix = display_prefix(&secret);

    MintedSecret {
        secret,
        hash,
        prefix,
    }
}

/// SHA-256 over the full textual secret, lowercase hex. Deterministic; the
/// hash itself is the lookup key, so constant-time comparison is not needed.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().encode_hex::<String>()
}

pub fn display_prefix(secret: &str) -> String {
    secret
        .chars()
        .take(DISPLAY_PREFIX_LEN)
        .collect::<String>()
}

/// Exact wire shape: `pg_` followed by 64 lowercase hex chars. Anything
/// else is treated identically to an unknown token by callers.
pub fn is_valid_format(secret: &str) -> bool {
    let Some(rest) = secret.strip_prefix(SECRET_PREFIX) else {
        return false;
    };

    rest.len() == SECRET_LEN - SECRET_PREFIX.len()
        && rest
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Pull the secret out of `Authorization: Bearer <secret>`.
pub fn bearer_secret(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingHeader)?;

    let secret = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(|s| s.trim())
        .ok_or(AuthError::NotBearer)?;

    if !is_valid_format(secret) {
        return Err(AuthError::MalformedSecret);
    }

    Ok(secret.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_secrets_have_the_documented_shape() {
        let minted = mint();

        assert!(minted.secret.starts_with(SECRET_PREFIX));
        assert_eq!(minted.secret.len(), SECRET_LEN);
        assert_eq!(minted.hash.len(), 64);
        assert_eq!(minted.prefix, &minted.secret[..DISPLAY_PREFIX_LEN]);
        assert_eq!(hash_secret(&minted.secret), minted.hash);
        assert!(is_valid_format(&minted.secret));
    }

    #[test]
    fn hashing_is_deterministic() {
        let secret = "pg_0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(hash_secret(secret), hash_secret(secret));
    }

    #[test]
    fn format_check_rejects_near_misses() {
        assert!(is_valid_format(
            "pg_0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));

        // wrong prefix
        assert!(!is_valid_format(
            "xx_0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        // too short
        assert!(!is_valid_format("pg_0123456789abcdef"));
        // too long
        assert!(!is_valid_format(
            "pg_0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef00"
        ));
        // uppercase hex is not the wire form
        assert!(!is_valid_format(
            "pg_0123456789ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef"
        ));
        // 64 non-hex characters after the prefix
        assert!(!is_valid_format(&format!("pg_{}", "z".repeat(64))));
    }

    #[test]
    fn bearer_secret_requires_the_bearer_scheme() {
        let minted = mint();

        let mut headers = HeaderMap::new();
        assert_eq!(bearer_secret(&headers), Err(AuthError::MissingHeader));

        headers.insert(
            header::AUTHORIZATION,
            minted.secret.parse().expect("header value"),
        );
        assert_eq!(bearer_secret(&headers), Err(AuthError::NotBearer));

        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", minted.secret)
                .parse()
                .expect("header value"),
        );
        assert_eq!(bearer_secret(&headers), Ok(minted.secret.clone()));
    }

    #[test]
    fn bearer_secret_rejects_malformed_secrets() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer not_a_token".parse().expect("header value"),
        );
        assert_eq!(bearer_secret(&headers), Err(AuthError::MalformedSecret));
    }
}
