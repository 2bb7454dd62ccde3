use std::path::Path;

use russh_keys::key::KeyPair;

use crate::error::{ProxyError, Result};

/// Reads a PEM-encoded private key from disk and parses it into a signer
/// usable as either the proxy's host key or its client identity toward the
/// upstream. Grounded in `original_source/main.go`'s `GetPrivateKey` and
/// `shelldeck_ssh::client::auth_with_key`'s key-decoding path.
pub fn load_signer(path: &Path, passphrase: Option<&str>) -> Result<KeyPair> {
    let path_str = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|source| ProxyError::ConfigRead {
        path: path_str.clone(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(ProxyError::EmptyKey { path: path_str });
    }

    russh_keys::decode_secret_key(
        std::str::from_utf8(&bytes).map_err(|_| ProxyError::KeyParse {
            path: path_str.clone(),
            source: russh_keys::Error::CouldNotReadKey,
        })?,
        passphrase,
    )
    .map_err(|source| ProxyError::KeyParse {
        path: path_str,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty_key");
        std::fs::File::create(&path).unwrap();

        let err = load_signer(&path, None).unwrap_err();
        assert!(matches!(err, ProxyError::EmptyKey { .. }));
    }

    #[test]
    fn garbage_contents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage_key");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"this is not a key").unwrap();

        let err = load_signer(&path, None).unwrap_err();
        assert!(matches!(err, ProxyError::KeyParse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist");

        let err = load_signer(&path, None).unwrap_err();
        assert!(matches!(err, ProxyError::ConfigRead { .. }));
    }
}
