use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{
    fmt::{Debug, Write},
    ops::Deref,
    str::{FromStr, Utf8Error},
    string::ToString,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error<P> {
    #[error("Bytes to string failed")]
    Utf8(#[from] Utf8Error),
    #[error("Parse failed")]
    Parse(P),
}

pub trait ParseBytes {
    fn parse_bytes<T: FromStr>(&self) -> Result<T, Error<T::Err>>;
}
impl<B: Deref<Target = [u8]>> ParseBytes for B {
    fn parse_bytes<T: FromStr>(&self) -> Result<T, Error<T::Err>> {
        std::str::from_utf8(self)?.parse().map_err(Error::Parse)
    }
}

pub trait ToBytes {
    fn to_bytes(&self) -> Vec<u8>;
}
impl<T: ToString> ToBytes for T {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// Characters left as is when encoding serial data, same as HTML form encoding.
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_');

/// Decode form-style URL encoding (`+` is a space) into raw bytes.
pub fn url_decode(text: &str) -> Vec<u8> {
    percent_decode_str(&text.replace('+', " ")).collect()
}

pub fn url_encode(bytes: &[u8]) -> String {
    percent_encode(bytes, FORM).to_string()
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{:02x} ", b);
        s
    })
}

pub mod prelude {
    pub use super::{ParseBytes, ToBytes};
}
