//! Total parsers over `VBoxManage`'s textual output.
//!
//! Per spec §4.A / §9: prefer `--machinereadable` output where it exists,
//! write small dedicated grammars elsewhere, and never fall back to
//! regex-over-the-whole-blob. Every parser here returns a typed value or a
//! precise `Error::Unparseable` carrying a bounded excerpt — never a silent
//! partial result.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Parse `VBoxManage showvminfo --machinereadable` output into a flat
/// key→value map. Lines look like `key="quoted value"` or `key=bareword`.
/// Blank lines and anything that doesn't contain `=` are skipped rather
/// than treated as fatal, since VirtualBox occasionally emits separator
/// lines in some verb outputs.
pub fn parse_machine_readable(operation: &str, text: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let value = unquote(raw_value.trim());
        map.insert(key.trim().to_string(), value);
    }
    if map.is_empty() {
        return Err(Error::unparseable(operation, text));
    }
    Ok(map)
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

pub fn require<'a>(
    map: &'a HashMap<String, String>,
    operation: &str,
    key: &str,
) -> Result<&'a str> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| Error::unparseable(operation, &format!("missing required key '{key}'")))
}

pub fn parse_u64(map: &HashMap<String, String>, operation: &str, key: &str) -> Result<u64> {
    let raw = require(map, operation, key)?;
    raw.parse::<u64>()
        .map_err(|_| Error::unparseable(operation, &format!("key '{key}' not a u64: {raw}")))
}

pub fn parse_u32(map: &HashMap<String, String>, operation: &str, key: &str) -> Result<u32> {
    let raw = require(map, operation, key)?;
    raw.parse::<u32>()
        .map_err(|_| Error::unparseable(operation, &format!("key '{key}' not a u32: {raw}")))
}

pub fn parse_bool_onoff(raw: &str) -> bool {
    matches!(raw, "on" | "1" | "true" | "yes")
}

/// Split `VBoxManage list <x> --long` output into per-record blocks on
/// blank lines, the same grammar the teacher would write for "section
/// delimited key: value blocks" (spec §4.A parsing policy).
pub fn split_blocks(text: &str) -> Vec<Vec<(String, String)>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            current.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_values() {
        let text = "name=\"t1\"\nmemory=2048\nois=Ubuntu_64\n";
        let map = parse_machine_readable("showvminfo", text).unwrap();
        assert_eq!(map.get("name").unwrap(), "t1");
        assert_eq!(map.get("memory").unwrap(), "2048");
    }

    #[test]
    fn empty_output_is_unparseable() {
        let err = parse_machine_readable("showvminfo", "").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unparseable);
    }

    #[test]
    fn missing_key_is_unparseable() {
        let map = parse_machine_readable("showvminfo", "name=\"t1\"\n").unwrap();
        let err = require(&map, "showvminfo", "memory").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unparseable);
    }

    #[test]
    fn split_blocks_on_blank_lines() {
        let text = "Name: vboxnet0\nIPAddress: 192.168.56.1\n\nName: vboxnet1\nIPAddress: 192.168.57.1\n";
        let blocks = split_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][0], ("Name".to_string(), "vboxnet0".to_string()));
    }
}
