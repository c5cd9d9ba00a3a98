//! Rank-set parsing and debugger output cleanup helpers.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

static BRACKETTED_PASTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[\?2004[lh]\r*").expect("valid regex"));

static ANSI_COLOUR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[\d;]*m").expect("valid regex"));

/// Parse a rank selection string such as `"0,3-5,8"` into an ordered,
/// deduplicated list of ranks.
///
/// # Errors
///
/// Returns an error if any element is not a rank or a `lo-hi` range.
pub fn parse_ranks(ranks: &str) -> Result<Vec<u32>> {
    let mut out = std::collections::BTreeSet::new();
    for part in ranks.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .with_context(|| format!("invalid rank range [{part}]"))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .with_context(|| format!("invalid rank range [{part}]"))?;
            out.extend(lo..=hi);
        } else {
            let rank: u32 = part
                .parse()
                .with_context(|| format!("invalid rank [{part}]"))?;
            out.insert(rank);
        }
    }
    if out.is_empty() {
        bail!("no ranks found in [{ranks}]");
    }
    Ok(out.into_iter().collect())
}

/// Strip the bracketed-paste escape sequences (`ESC[?2004l` / `ESC[?2004h`,
/// with any trailing carriage returns) that PTY-driven backends emit around
/// their prompt.
pub fn strip_bracketted_paste(text: &str) -> String {
    BRACKETTED_PASTE.replace_all(text, "").into_owned()
}

/// Strip ANSI colour/attribute sequences from a string.
pub fn strip_control_characters(text: &str) -> String {
    ANSI_COLOUR.replace_all(text, "").into_owned()
}

/// Prefix every line of one rank's output with `rank:\t`.
///
/// The first line (the echoed command) and the trailing fragment after the
/// final CRLF are dropped.
pub fn prepend_ranks(rank: u32, result: &str) -> String {
    let lines: Vec<&str> = result.split("\r\n").collect();
    if lines.len() <= 2 {
        return String::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|line| format!("{rank}:\t{line}\r\n"))
        .collect()
}

/// Collate an aggregated response for display: ranks in ascending order,
/// empty results skipped, blocks separated by a divider line.
pub fn pretty_print_response(results: &HashMap<u32, String>) -> String {
    let sorted: BTreeMap<u32, &String> = results.iter().map(|(k, v)| (*k, v)).collect();
    let blocks: Vec<String> = sorted
        .iter()
        .filter(|(_, result)| !result.is_empty())
        .map(|(rank, result)| prepend_ranks(*rank, result))
        .collect();
    blocks.join(&format!("{}\n", "*".repeat(72)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranks_mixed() {
        assert_eq!(parse_ranks("1,3-5").unwrap(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_parse_ranks_dedupes_and_sorts() {
        assert_eq!(parse_ranks("5,1,3-5,1").unwrap(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_parse_ranks_single() {
        assert_eq!(parse_ranks("0").unwrap(), vec![0]);
    }

    #[test]
    fn test_parse_ranks_rejects_garbage() {
        assert!(parse_ranks("a-b").is_err());
        assert!(parse_ranks("").is_err());
        assert!(parse_ranks("1,,2").is_err());
    }

    #[test]
    fn test_strip_bracketted_paste() {
        let raw = "\x1b[?2004lhello\x1b[?2004h\r\nworld";
        assert_eq!(strip_bracketted_paste(raw), "hello\r\nworld");
    }

    #[test]
    fn test_strip_control_characters() {
        let raw = "\x1b[1;31mred\x1b[0m plain";
        assert_eq!(strip_control_characters(raw), "red plain");
    }

    #[test]
    fn test_prepend_ranks_drops_echo_and_tail() {
        let raw = "print x\r\n$1 = 42\r\nmore\r\n";
        assert_eq!(prepend_ranks(3, raw), "3:\t$1 = 42\r\n3:\tmore\r\n");
    }

    #[test]
    fn test_pretty_print_skips_empty_ranks() {
        let results = HashMap::from([
            (1, String::new()),
            (0, "bt\r\n#0 main ()\r\n".to_owned()),
        ]);
        let out = pretty_print_response(&results);
        assert_eq!(out, "0:\t#0 main ()\r\n");
    }

    #[test]
    fn test_pretty_print_orders_by_rank() {
        let results = HashMap::from([
            (2, "c\r\ntwo\r\n".to_owned()),
            (0, "c\r\nzero\r\n".to_owned()),
        ]);
        let out = pretty_print_response(&results);
        let zero = out.find("0:\tzero").unwrap();
        let two = out.find("2:\ttwo").unwrap();
        assert!(zero < two);
        assert!(out.contains(&"*".repeat(72)));
    }
}
