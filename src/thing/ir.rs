//! IR and serial code lookup.

use regex::Regex;
use std::{collections::HashMap, fs, io, path::Path, sync::OnceLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodeError {
    #[error("MAP file is not defined")]
    NoMap,
    #[error("No entry for '{0}' in map file")]
    Missing(String),
    #[error("Hex code is too short")]
    TooShort,
    #[error("Illegal hex code element 0, should be 0000")]
    Preamble,
    #[error("Unable to convert hex code element {0}")]
    Element(usize),
}

/// `KEY=VALUE` lines, `#` and `!` start comments.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    codes: HashMap<String, String>,
}

impl CodeMap {
    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(text: &str) -> Self {
        let codes = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Code for `name`. Pronto hex codes are converted to GlobalCache form.
    pub fn lookup(&self, name: &str) -> Result<String, CodeError> {
        let code = self
            .codes
            .get(name)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CodeError::Missing(name.to_string()))?;
        if is_hex_code(code) {
            log::debug!("Code is in hex format, convert to GC format");
            let gc = hex_to_gc(code)?;
            log::debug!("Converted hex code is: {}", gc);
            Ok(gc)
        } else {
            Ok(code.clone())
        }
    }
}

fn is_hex_code(code: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("0000( +[0-9A-Fa-f]{4})+").expect("valid regex"))
        .is_match(code)
}

/// Convert a Pronto hex IR code to the GlobalCache `freq,repeat,offset,on,off,...` form.
pub fn hex_to_gc(hex: &str) -> Result<String, CodeError> {
    const FREQ_FACTOR: u32 = 4145146;
    const REPEAT: u32 = 1;

    let words = hex.split_whitespace().collect::<Vec<_>>();
    if words.len() < 5 {
        return Err(CodeError::TooShort);
    }
    if words[0] != "0000" {
        return Err(CodeError::Preamble);
    }
    let word = |i: usize| u32::from_str_radix(words[i], 16).map_err(|_| CodeError::Element(i));

    let carrier = word(1)?;
    if carrier == 0 {
        return Err(CodeError::Element(1));
    }
    let frequency = FREQ_FACTOR / carrier;
    let offset = word(2)? * 2 + 1;

    // Element 3 (second sequence length) is not used.
    let mut gc = format!("{},{},{}", frequency, REPEAT, offset);
    for i in 4..words.len() {
        gc.push(',');
        gc.push_str(&word(i)?.to_string());
    }
    Ok(gc)
}
