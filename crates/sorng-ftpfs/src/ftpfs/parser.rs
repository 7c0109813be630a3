//! Directory listing parser.
//!
//! Each line is tried as an MLSD fact line (RFC 3659), then as `ls -l`
//! output, then as a DOS/IIS row. Lines that match none of them are kept
//! as `Unknown` entries named after the whole line.
//!
//! Self (`.`) and parent (`..`) rows are returned like any other entry;
//! MLSD `cdir` / `pdir` facts are renamed to them so both listing commands
//! look the same to the dialect layer.

use crate::ftpfs::types::{FtpEntry, FtpEntryKind};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref LS_LINE: Regex = Regex::new(
        r"(?x)
        ^(?P<type>[-dlcbps])(?P<mode>[rwxsStT-]{9})[+@.]?\s+
        \d+\s+
        (?P<owner>\S+)\s+
        (?P<group>\S+)\s+
        (?P<size>\d+)\s+
        (?P<stamp>[A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s
        (?P<name>.+)$
        ",
    )
    .expect("valid ls -l pattern");
    static ref DOS_LINE: Regex = Regex::new(
        r"(?x)
        ^(?P<date>\d{2}-\d{2}-(?:\d{4}|\d{2}))\s+
        (?P<time>\d{1,2}:\d{2}\s?(?:[AaPp][Mm])?)\s+
        (?:(?P<dir><DIR>)|(?P<size>\d+))\s+
        (?P<name>.+)$
        ",
    )
    .expect("valid DOS listing pattern");
}

/// Parse the body of a `LIST` or `MLSD` transfer.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    ListingParser::new(Utc::now()).parse(raw)
}

/// `rwxr-x---` to `0o750`. Setuid, setgid and sticky letters in the
/// execute column count as execute only when lower case.
pub fn parse_permission_bits(mode: &str) -> Option<u32> {
    if mode.len() != 9 {
        return None;
    }
    let bits = mode.bytes().enumerate().fold(0u32, |acc, (i, b)| {
        let granted = match (i % 3, b) {
            (0, b'r') | (1, b'w') => true,
            (2, b'x') | (2, b's') | (2, b't') => true,
            _ => false,
        };
        if granted {
            acc | (0o400 >> i)
        } else {
            acc
        }
    });
    Some(bits)
}

/// Parses listings relative to a fixed "now", which `ls -l` needs for rows
/// that omit the year.
struct ListingParser {
    now: DateTime<Utc>,
}

impl ListingParser {
    fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    fn parse(&self, raw: &str) -> Vec<FtpEntry> {
        raw.split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty() && !line.starts_with("total "))
            .map(|line| self.entry(line))
            .collect()
    }

    fn entry(&self, line: &str) -> FtpEntry {
        let parsed = if line.contains('=') && line.contains("; ") {
            mlsd_entry(line)
        } else {
            None
        };
        let mut entry = parsed
            .or_else(|| self.ls_entry(line))
            .or_else(|| dos_entry(line))
            .unwrap_or_else(|| blank(line.trim(), FtpEntryKind::Unknown));
        entry.raw = Some(line.to_string());
        entry
    }

    fn ls_entry(&self, line: &str) -> Option<FtpEntry> {
        let caps = LS_LINE.captures(line)?;
        let kind = match &caps["type"] {
            "-" => FtpEntryKind::File,
            "d" => FtpEntryKind::Directory,
            "l" => FtpEntryKind::Symlink,
            _ => FtpEntryKind::Unknown,
        };
        let shown = caps["name"].trim_start();
        let (name, link_target) = match shown.split_once(" -> ") {
            Some((name, target)) if kind == FtpEntryKind::Symlink => (name, Some(target.to_string())),
            _ => (shown, None),
        };

        let mut entry = blank(name, kind);
        entry.size = caps["size"].parse().unwrap_or(0);
        entry.modified = self.ls_timestamp(&caps["stamp"]);
        entry.permissions = parse_permission_bits(&caps["mode"]);
        entry.owner = Some(caps["owner"].to_string());
        entry.group = Some(caps["group"].to_string());
        entry.link_target = link_target;
        Some(entry)
    }

    /// `Mar  7 14:05` (recent, year implied) or `Mar  7  2023`.
    fn ls_timestamp(&self, stamp: &str) -> Option<DateTime<Utc>> {
        let parts: Vec<&str> = stamp.split_whitespace().collect();
        let (month, day, tail) = match parts.as_slice() {
            [month, day, tail] => (*month, *day, *tail),
            _ => return None,
        };

        if !tail.contains(':') {
            let date = NaiveDate::parse_from_str(&format!("{} {} {}", tail, month, day), "%Y %b %d").ok()?;
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }

        let at_year = |year: i32| {
            NaiveDateTime::parse_from_str(&format!("{} {} {} {}", year, month, day, tail), "%Y %b %d %H:%M")
                .ok()
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        let this_year = at_year(self.now.year());
        match this_year {
            // Servers show the time only for the last six months, so a
            // stamp ahead of now belongs to last year.
            Some(dt) if dt > self.now + Duration::days(1) => at_year(self.now.year() - 1),
            // Feb 29 of a past leap year.
            None => at_year(self.now.year() - 1),
            other => other,
        }
    }
}

fn blank(name: &str, kind: FtpEntryKind) -> FtpEntry {
    FtpEntry {
        name: name.to_string(),
        kind,
        size: 0,
        modified: None,
        permissions: None,
        owner: None,
        group: None,
        link_target: None,
        raw: None,
        facts: HashMap::new(),
    }
}

/// `type=file;size=12;modify=20240101120000; name`
fn mlsd_entry(line: &str) -> Option<FtpEntry> {
    let (fact_list, name) = line.split_once("; ")?;
    if name.is_empty() {
        return None;
    }
    let facts: HashMap<String, String> = fact_list
        .split(';')
        .filter_map(|fact| fact.trim().split_once('='))
        .map(|(key, value)| (key.to_ascii_lowercase(), value.to_string()))
        .collect();

    let type_fact = facts.get("type").cloned().unwrap_or_default();
    let lowered = type_fact.to_ascii_lowercase();
    let mut entry = match lowered.as_str() {
        "cdir" => blank(".", FtpEntryKind::Directory),
        "pdir" => blank("..", FtpEntryKind::Directory),
        "dir" => blank(name, FtpEntryKind::Directory),
        "file" => blank(name, FtpEntryKind::File),
        t if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            let mut link = blank(name, FtpEntryKind::Symlink);
            // `OS.unix=slink:/target`; the target keeps its case.
            link.link_target = type_fact
                .split_once(':')
                .map(|(_, target)| target.to_string())
                .filter(|target| !target.is_empty());
            link
        }
        _ => blank(name, FtpEntryKind::Unknown),
    };

    entry.size = ["size", "sizd"]
        .iter()
        .find_map(|key| facts.get(*key))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    entry.modified = facts.get("modify").and_then(|v| mlsd_timestamp(v));
    entry.permissions = facts
        .get("unix.mode")
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .map(|m| m & 0o777);
    entry.owner = facts.get("unix.owner").or_else(|| facts.get("unix.uid")).cloned();
    entry.group = facts.get("unix.group").or_else(|| facts.get("unix.gid")).cloned();
    entry.facts = facts;
    Some(entry)
}

/// `YYYYMMDDHHMMSS`, optionally followed by a fraction.
fn mlsd_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let whole = value.split('.').next()?;
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// `03-07-24  02:05PM       <DIR> Reports` or with a byte count.
fn dos_entry(line: &str) -> Option<FtpEntry> {
    let caps = DOS_LINE.captures(line)?;
    let mut entry = if caps.name("dir").is_some() {
        blank(&caps["name"], FtpEntryKind::Directory)
    } else {
        let mut file = blank(&caps["name"], FtpEntryKind::File);
        file.size = caps.name("size").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        file
    };
    let stamp = format!("{} {}", &caps["date"], caps["time"].replace(' ', "").to_ascii_uppercase());
    entry.modified = ["%m-%d-%y %I:%M%p", "%m-%d-%Y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&stamp, format).ok())
        .map(|dt| Utc.from_utc_datetime(&dt));
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: &[FtpEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn ls_rows_keep_self_and_parent() {
        let raw = "total 12\r\n\
                   drwxr-xr-x   4 ftp  ftp      4096 Mar  7 14:05 .\r\n\
                   drwxr-xr-x  12 ftp  ftp      4096 Mar  7 14:05 ..\r\n\
                   drwxr-x---   2 ftp  staff    4096 Jun 30  2023 quarterly reports\r\n\
                   -rw-r--r--   1 alice staff   2048 Mar  1 09:00 notes.md\r\n";
        let entries = parse_listing(raw);
        assert_eq!(names(&entries), vec![".", "..", "quarterly reports", "notes.md"]);
        assert_eq!(entries[2].kind, FtpEntryKind::Directory);
        assert_eq!(entries[2].permissions, Some(0o750));
        assert_eq!(entries[3].kind, FtpEntryKind::File);
        assert_eq!(entries[3].size, 2048);
        assert_eq!(entries[3].owner.as_deref(), Some("alice"));
        assert_eq!(entries[3].group.as_deref(), Some("staff"));
        assert!(entries[3].raw.as_deref().unwrap().ends_with("notes.md"));
    }

    #[test]
    fn ls_symbolic_link() {
        let entries = parse_listing("lrwxrwxrwx   1 ftp ftp   11 Jan 15 08:00 latest -> builds/1.4.2");
        assert_eq!(entries[0].kind, FtpEntryKind::Symlink);
        assert_eq!(entries[0].name, "latest");
        assert_eq!(entries[0].link_target.as_deref(), Some("builds/1.4.2"));
    }

    #[test]
    fn ls_timestamps_without_year_never_land_in_the_future() {
        let now = Utc.with_ymd_and_hms(2024, 2, 10, 12, 0, 0).unwrap();
        let parser = ListingParser::new(now);
        let past = parser.ls_timestamp("Feb  1 10:30").unwrap();
        assert_eq!(past, Utc.with_ymd_and_hms(2024, 2, 1, 10, 30, 0).unwrap());
        let rolled = parser.ls_timestamp("Dec 24 18:00").unwrap();
        assert_eq!(rolled, Utc.with_ymd_and_hms(2023, 12, 24, 18, 0, 0).unwrap());
        let dated = parser.ls_timestamp("Jun 30  2021").unwrap();
        assert_eq!(dated, Utc.with_ymd_and_hms(2021, 6, 30, 0, 0, 0).unwrap());
    }

    #[test]
    fn permission_letters() {
        assert_eq!(parse_permission_bits("rwsr-xr-t"), Some(0o755));
        assert_eq!(parse_permission_bits("rwSr--r-T"), Some(0o644));
        assert_eq!(parse_permission_bits("r--------"), Some(0o400));
        assert_eq!(parse_permission_bits("rwx"), None);
    }

    #[test]
    fn mlsd_facts() {
        let raw = "type=cdir;modify=20240307140500; /pub\r\n\
                   type=pdir;modify=20240101000000; /\r\n\
                   type=file;size=512;modify=20240307140500.250;UNIX.mode=0640;UNIX.owner=alice; data.csv\r\n\
                   type=OS.unix=slink:/srv/Archive; archive\r\n";
        let entries = parse_listing(raw);
        assert_eq!(names(&entries), vec![".", "..", "data.csv", "archive"]);
        assert_eq!(entries[2].size, 512);
        assert_eq!(entries[2].permissions, Some(0o640));
        assert_eq!(entries[2].owner.as_deref(), Some("alice"));
        assert_eq!(
            entries[2].modified,
            Some(Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 0).unwrap())
        );
        assert_eq!(entries[3].kind, FtpEntryKind::Symlink);
        assert_eq!(entries[3].link_target.as_deref(), Some("/srv/Archive"));
    }

    #[test]
    fn dos_rows() {
        let raw = "03-07-24  02:05PM       <DIR>          Quarterly Reports\r\n\
                   03-07-2024  09:15AM            1536 budget.xlsx";
        let entries = parse_listing(raw);
        assert_eq!(names(&entries), vec!["Quarterly Reports", "budget.xlsx"]);
        assert_eq!(entries[0].kind, FtpEntryKind::Directory);
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 0).unwrap())
        );
        assert_eq!(entries[1].size, 1536);
    }

    #[test]
    fn unrecognised_lines_are_kept() {
        let entries = parse_listing("some opaque row\n");
        assert_eq!(entries[0].kind, FtpEntryKind::Unknown);
        assert_eq!(entries[0].name, "some opaque row");
    }
}
