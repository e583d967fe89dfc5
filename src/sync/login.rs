//! Login accounts and the challenge-response password hashing.
//!
//! Passwords are stored as `{base64(sha1(password))}` (brace-wrapped,
//! base-64 filler stripped). On the wire both sides exchange a hex SHA-1
//! over the stored hash and the two session salts, never the hash itself.

use std::collections::HashMap;

use base64::Engine as _;

use super::Allow;

/// One account the server will accept.
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub user_name: String,
    pub pw_hash: String,
    pub allow: Allow,
}

/// The server-side account table.
#[derive(Debug, Default)]
pub struct LoginTable {
    accounts: HashMap<String, AccessEntry>,
}

impl LoginTable {
    pub fn new() -> LoginTable {
        LoginTable::default()
    }

    /// Adds an account. `password` may be a plaintext password or an
    /// already-hashed `{...}` string.
    pub fn add_access(&mut self, user_name: &str, password: &str, allow: Allow) {
        let pw_hash = if is_pw_hash(password) {
            password.to_string()
        } else {
            password_hash(password)
        };
        self.accounts.insert(
            user_name.to_string(),
            AccessEntry { user_name: user_name.to_string(), pw_hash, allow },
        );
    }

    pub fn find_access(&self, user_name: &str) -> Option<&AccessEntry> {
        self.accounts.get(user_name)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// The at-rest hash of a password: `{base64(sha1(pw))}` without filler.
pub fn password_hash(password: &str) -> String {
    let digest = openssl::sha::sha1(password.as_bytes());
    let mut encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    while encoded.ends_with('=') {
        encoded.pop();
    }
    format!("{{{}}}", encoded)
}

/// True when `password` already is an at-rest hash.
pub fn is_pw_hash(password: &str) -> bool {
    password.starts_with('{') && password.ends_with('}')
}

/// The hex exchange hash sent over the wire:
/// `sha1(pwHash + "." + hex(saltA) + "." + hex(saltB))`.
pub fn pw_hash_xchg(salt_a: u32, salt_b: u32, pw_hash: &str) -> String {
    let salted = format!("{}.{:x}.{:x}", pw_hash, salt_a, salt_b);
    let digest = openssl::sha::sha1(salted.as_bytes());
    let mut hex = String::with_capacity(40);
    for b in digest {
        hex.push_str(&format!("{:02x}", b));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_format() {
        let hash = password_hash("secret");
        assert!(hash.starts_with('{') && hash.ends_with('}'));
        assert!(!hash.contains('='));
        assert!(is_pw_hash(&hash));
        assert!(!is_pw_hash("secret"));
        // Deterministic.
        assert_eq!(hash, password_hash("secret"));
        assert_ne!(hash, password_hash("Secret"));
    }

    #[test]
    fn test_xchg_hash() {
        let hash = password_hash("secret");
        let x1 = pw_hash_xchg(0x1234, 0xabcd, &hash);
        assert_eq!(x1.len(), 40);
        assert!(x1.bytes().all(|b| b.is_ascii_hexdigit()));
        // Salts are ordered: swapping them gives the reverse-direction hash.
        assert_ne!(x1, pw_hash_xchg(0xabcd, 0x1234, &hash));
        assert_eq!(x1, pw_hash_xchg(0x1234, 0xabcd, &hash));
    }

    #[test]
    fn test_login_table() {
        let mut table = LoginTable::new();
        table.add_access("alice", "pw1", Allow::all());
        table.add_access("bob", &password_hash("pw2"), Allow::READ);

        let alice = table.find_access("alice").unwrap();
        assert_eq!(alice.pw_hash, password_hash("pw1"));
        let bob = table.find_access("bob").unwrap();
        assert_eq!(bob.allow, Allow::READ);
        assert!(table.find_access("carol").is_none());
    }
}
