// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Kernel-style cpulist handling ("0-3,7").

use anyhow::bail;
use anyhow::Result;
use sscanf::sscanf;

/// Parse a cpulist into a sorted, deduplicated list of CPU ids.
pub fn parse(cpulist: &str) -> Result<Vec<u32>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    if cpulist.is_empty() {
        return Ok(vec![]);
    }

    let mut cpus = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{u32}-{u32}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{u32}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist component {:?}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Backwards range {}-{} in cpulist", min, max);
        }
        for cpu in min..=max {
            cpus.push(cpu);
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Format CPU ids as a compact cpulist, collapsing consecutive runs.
pub fn format(cpus: &[u32]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            i += 1;
            end = sorted[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}-{}", start, end));
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        assert_eq!(parse("3").unwrap(), vec![3]);
    }

    #[test]
    fn test_parse_ranges_and_singles() {
        assert_eq!(parse("0-3,7").unwrap(), vec![0, 1, 2, 3, 7]);
        assert_eq!(parse("5,1-2").unwrap(), vec![1, 2, 5]);
    }

    #[test]
    fn test_parse_trailing_newline() {
        // sysfs cpulists come with a trailing newline
        assert_eq!(parse("0-1\n").unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_parse_dedup() {
        assert_eq!(parse("1,1-2,2").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse("\n").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse("a-b").is_err());
        assert!(parse("3-1").is_err());
        assert!(parse("1,,2").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format(&[0, 1, 2, 3, 7]), "0-3,7");
        assert_eq!(format(&[4]), "4");
        assert_eq!(format(&[2, 0, 1]), "0-2");
        assert_eq!(format(&[]), "");
    }

    #[test]
    fn test_roundtrip() {
        let cpus = vec![0, 2, 3, 4, 9];
        assert_eq!(parse(&format(&cpus)).unwrap(), cpus);
    }
}
