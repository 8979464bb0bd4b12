//! Parsers for server listings and reply payloads.
//!
//! Structured MLSD/MLST facts are preferred; when the server predates RFC
//! 3659 the legacy `LIST` output is parsed in its two common dialects,
//! Unix-like (`drwxr-xr-x ... Dec 10 12:34 name`) and DOS-like
//! (`12-10-20 12:34PM <DIR> name`). Unknown lines are skipped with a warning,
//! matching what FTP clients have always had to do.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use libremfs::storage::FileStats;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::warn;

/// Optional capabilities advertised through `FEAT`.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Features {
    pub mlsd: bool,
    pub mlst: bool,
    pub rest: bool,
}

/// Extracts capabilities from a `FEAT` reply body.
pub(crate) fn parse_features(text: &str) -> Features {
    let upper = text.to_uppercase();
    let tokens: Vec<&str> = upper.split_whitespace().collect();
    Features {
        mlsd: tokens.iter().any(|t| *t == "MLSD"),
        mlst: tokens.iter().any(|t| t.starts_with("MLST")),
        rest: tokens.iter().any(|t| *t == "REST"),
    }
}

/// Parses the address out of a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
/// reply. Some servers omit the parentheses.
pub(crate) fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let start = match text.find('(') {
        Some(idx) => idx + 1,
        None => text.find(|c: char| c.is_ascii_digit())?,
    };
    let rest = &text[start..];
    let end = rest.find(')').unwrap_or(rest.len());
    let fields: Vec<u16> = rest[..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != 6 || fields[..4].iter().any(|f| *f > 255) {
        return None;
    }
    let ip = Ipv4Addr::new(
        fields[0] as u8,
        fields[1] as u8,
        fields[2] as u8,
        fields[3] as u8,
    );
    let port = fields[4].checked_mul(256)?.checked_add(fields[5])?;
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Parses one MLSD row or MLST facts line: `fact=value;...; name`.
pub(crate) fn parse_mlsx_line(line: &str) -> Option<FileStats> {
    let line = line.trim();
    let (facts, name) = line.split_once(' ')?;
    let name = name.trim();
    if name.is_empty() || !facts.contains('=') {
        return None;
    }
    let mut kind = "";
    let mut size = 0u64;
    let mut modified = Utc::now();
    for fact in facts.split(';') {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_lowercase().as_str() {
            "type" => kind = value,
            "size" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_mlsx_time(value),
            _ => {}
        }
    }
    let is_dir = matches!(kind.to_lowercase().as_str(), "dir" | "cdir" | "pdir");
    Some(if is_dir {
        FileStats::dir(name, modified)
    } else {
        FileStats::file(name, size, modified)
    })
}

/// `modify` facts are `YYYYMMDDHHMMSS`, optionally with fractional seconds.
fn parse_mlsx_time(value: &str) -> DateTime<Utc> {
    let value = value.split('.').next().unwrap_or(value);
    match chrono::NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S") {
        Ok(naive) => naive.and_utc(),
        Err(_) => {
            warn!(value, "unparseable MLSx modify fact");
            Utc::now()
        }
    }
}

/// Parses a single legacy `LIST` line, trying the Unix dialect first and the
/// DOS dialect second. Returns `None` for lines in neither shape.
pub(crate) fn parse_list_line(line: &str) -> Option<FileStats> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    if parts[0].len() >= 10 && matches!(parts[0].as_bytes()[0], b'd' | b'l' | b'-') {
        return parse_unix_list_line(&parts, line);
    }
    if parts[0].contains('-') && parts[0].len() <= 10 {
        return parse_dos_list_line(&parts, line);
    }
    warn!(line, "unknown LIST format");
    None
}

/// `drwxr-xr-x  2 user group 4096 Dec 10 12:34 file name`
fn parse_unix_list_line(parts: &[&str], line: &str) -> Option<FileStats> {
    if parts.len() < 9 {
        return None;
    }
    let is_dir = parts[0].starts_with('d');
    let size = if is_dir { 0 } else { parts[4].parse().ok()? };
    let modified = parse_unix_list_time(&parts[5..8]);

    // The name may contain runs of spaces, so walk the raw line past the size
    // field and the three date/time fields instead of re-joining tokens.
    let size_end = line.find(parts[4])? + parts[4].len();
    let mut rest = line[size_end..].trim_start();
    for _ in 0..3 {
        let cut = rest.find(char::is_whitespace)?;
        rest = rest[cut..].trim_start();
    }
    let name = rest.trim_end();
    if name.is_empty() {
        return None;
    }
    Some(if is_dir {
        FileStats::dir(name, modified)
    } else {
        FileStats::file(name, size, modified)
    })
}

/// `Dec 10 12:34` within the last year, `Dec 10  2020` otherwise.
fn parse_unix_list_time(fields: &[&str]) -> DateTime<Utc> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let fallback = Utc::now();
    if fields.len() < 3 {
        return fallback;
    }
    let month = match MONTHS
        .iter()
        .position(|m| *m == fields[0].to_lowercase().as_str())
    {
        Some(idx) => idx as u32 + 1,
        None => return fallback,
    };
    let Ok(day) = fields[1].parse::<u32>() else {
        return fallback;
    };
    let (year, hour, minute) = if let Some((h, m)) = fields[2].split_once(':') {
        let (Ok(hour), Ok(minute)) = (h.parse(), m.parse()) else {
            return fallback;
        };
        (Utc::now().year(), hour, minute)
    } else {
        match fields[2].parse::<i32>() {
            Ok(year) => (year, 0, 0),
            Err(_) => return fallback,
        }
    };
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(fallback)
}

/// `12-10-20  12:34PM  <DIR>  name` or `12-10-20  12:34PM  1234 name`
fn parse_dos_list_line(parts: &[&str], line: &str) -> Option<FileStats> {
    let is_dir = line.contains("<DIR>");
    let (size, name_start) = if is_dir {
        let dir_idx = parts.iter().position(|p| *p == "<DIR>")?;
        (0, dir_idx + 1)
    } else {
        (parts[2].parse().ok()?, 3)
    };
    if parts.len() <= name_start {
        return None;
    }
    let name = parts[name_start..].join(" ");
    let modified = parse_dos_list_time(parts[0], parts[1]);
    Some(if is_dir {
        FileStats::dir(name, modified)
    } else {
        FileStats::file(name, size, modified)
    })
}

/// `MM-DD-YY HH:MM(AM|PM)`, two-digit years pivoting at 70.
fn parse_dos_list_time(date: &str, time: &str) -> DateTime<Utc> {
    let fallback = Utc::now();
    let mut date_fields = date.split('-').map(|f| f.parse::<i32>());
    let (Some(Ok(month)), Some(Ok(day)), Some(Ok(mut year))) =
        (date_fields.next(), date_fields.next(), date_fields.next())
    else {
        return fallback;
    };
    if year < 100 {
        year += if year < 70 { 2000 } else { 1900 };
    }
    let upper = time.to_uppercase();
    let is_pm = upper.contains("PM");
    let bare = upper.replace("AM", "").replace("PM", "");
    let Some((h, m)) = bare.split_once(':') else {
        return fallback;
    };
    let (Ok(mut hour), Ok(minute)) = (h.parse::<u32>(), m.parse::<u32>()) else {
        return fallback;
    };
    if is_pm && hour != 12 {
        hour += 12;
    } else if !is_pm && hour == 12 {
        hour = 0;
    }
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use pretty_assertions::assert_eq;

    #[test]
    fn features_from_feat_body() {
        let feat = "Features:\n MLST type*;size*;modify*;\n MLSD\n REST STREAM\n UTF8\nEnd";
        let features = parse_features(feat);
        assert!(features.mlsd);
        assert!(features.mlst);
        assert!(features.rest);

        let none = parse_features("Features:\n UTF8\nEnd");
        assert!(!none.mlsd && !none.mlst && !none.rest);
    }

    #[test]
    fn pasv_reply_with_parens() {
        let addr = parse_pasv("Entering Passive Mode (192,168,0,130,19,137).").unwrap();
        assert_eq!(addr.to_string(), "192.168.0.130:5001");
    }

    #[test]
    fn pasv_reply_without_parens() {
        let addr = parse_pasv("Entering Passive Mode 10,0,0,1,4,0").unwrap();
        assert_eq!(addr.to_string(), "10.0.0.1:1024");
    }

    #[test]
    fn pasv_reply_garbage_is_none() {
        assert!(parse_pasv("Entering Passive Mode").is_none());
        assert!(parse_pasv("(1,2,3)").is_none());
    }

    #[test]
    fn mlsd_file_row() {
        let stats = parse_mlsx_line("type=file;size=1234;modify=20201210123456; report.pdf").unwrap();
        assert_eq!(stats.name, "report.pdf");
        assert_eq!(stats.size, 1234);
        assert!(!stats.is_directory);
        assert_eq!(
            stats.modified,
            Utc.with_ymd_and_hms(2020, 12, 10, 12, 34, 56).single().unwrap()
        );
    }

    #[test]
    fn mlsd_dir_row_ignores_size() {
        let stats = parse_mlsx_line("type=dir;sizd=4096;modify=20201210123456; photos").unwrap();
        assert!(stats.is_directory);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn mlsd_fractional_seconds() {
        let stats = parse_mlsx_line("type=file;size=1;modify=20201210123456.123; a").unwrap();
        assert_eq!(stats.modified.second(), 56);
    }

    #[test]
    fn unix_list_file_line() {
        let stats =
            parse_list_line("-rw-r--r--  1 alice staff   4096 Dec 10 12:34 notes.txt").unwrap();
        assert_eq!(stats.name, "notes.txt");
        assert_eq!(stats.size, 4096);
        assert!(!stats.is_directory);
        assert_eq!(stats.modified.month(), 12);
        assert_eq!(stats.modified.day(), 10);
        assert_eq!(stats.modified.hour(), 12);
        assert_eq!(stats.modified.minute(), 34);
    }

    #[test]
    fn unix_list_dir_line_with_year() {
        let stats = parse_list_line("drwxr-xr-x  2 alice staff   4096 Dec 10  2020 backups").unwrap();
        assert!(stats.is_directory);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.modified.year(), 2020);
    }

    #[test]
    fn unix_list_name_with_spaces() {
        let stats =
            parse_list_line("-rw-r--r--  1 alice staff     12 Dec 10 12:34 two  words.txt").unwrap();
        assert_eq!(stats.name, "two  words.txt");
    }

    #[test]
    fn dos_list_file_line() {
        let stats = parse_list_line("12-10-20  12:34PM              1234 report.docx").unwrap();
        assert_eq!(stats.name, "report.docx");
        assert_eq!(stats.size, 1234);
        assert!(!stats.is_directory);
        assert_eq!(stats.modified.year(), 2020);
        assert_eq!(stats.modified.hour(), 12);
    }

    #[test]
    fn dos_list_dir_line() {
        let stats = parse_list_line("12-10-20  09:05AM       <DIR>          My Documents").unwrap();
        assert!(stats.is_directory);
        assert_eq!(stats.name, "My Documents");
        assert_eq!(stats.modified.hour(), 9);
    }

    #[test]
    fn dos_list_midnight_and_noon() {
        let noon = parse_list_line("01-02-21  12:00PM  10 a").unwrap();
        assert_eq!(noon.modified.hour(), 12);
        let midnight = parse_list_line("01-02-21  12:00AM  10 a").unwrap();
        assert_eq!(midnight.modified.hour(), 0);
    }

    #[test]
    fn unknown_list_lines_are_skipped() {
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("total 16").is_none());
        assert!(parse_list_line("!!! banner line from an odd server").is_none());
    }
}
