use rand::RngCore;
use std::fmt;

/// Length of the handshake secret in bytes.
pub const SECRET_LEN: usize = 16;

pub type Secret = [u8; SECRET_LEN];

#[derive(Debug, Eq, PartialEq)]
pub enum ParseError {
    TokenCount(usize),
    BadToken(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::TokenCount(count) => {
                write!(f, "expected {} secret tokens, got {}", SECRET_LEN, count)
            }
            ParseError::BadToken(token) => write!(f, "malformed secret token {:?}", token),
        }
    }
}

/// Generates a new secret from OS entropy.
#[inline]
pub fn generate() -> Secret {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// Formats the secret as space-separated two-digit hex tokens.
pub fn to_hex_tokens(secret: &Secret) -> String {
    let mut out = String::with_capacity(SECRET_LEN * 3);

    for (index, byte) in secret.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }

    out
}

/// Parses a line of space-separated hex tokens. Both `NN` and `0xNN` token
/// forms are accepted.
pub fn parse_hex_tokens(line: &str) -> Result<Secret, ParseError> {
    let mut secret = [0u8; SECRET_LEN];
    let mut count = 0;

    for token in line.split_whitespace() {
        let digits = if token.starts_with("0x") || token.starts_with("0X") {
            &token[2..]
        } else {
            token
        };

        let byte =
            u8::from_str_radix(digits, 16).map_err(|_| ParseError::BadToken(token.to_string()))?;

        if count == SECRET_LEN {
            return Err(ParseError::TokenCount(count + 1));
        }

        secret[count] = byte;
        count += 1;
    }

    if count != SECRET_LEN {
        return Err(ParseError::TokenCount(count));
    }

    Ok(secret)
}

/// Compares two byte strings in constant time over their common length.
#[inline]
pub fn ct_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }

    let mut acc = 0u8;

    for (a, b) in lhs.iter().zip(rhs.iter()) {
        acc |= a ^ b;
    }

    acc == 0
}
