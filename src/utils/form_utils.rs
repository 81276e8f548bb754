#![forbid(unsafe_code)]

use path_absolutize::Absolutize;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use chrono::{Utc, DateTime, Duration, SecondsFormat};

use poem::Request;

use log::{debug, LevelFilter};

// ***************************************************************************
// GENERAL PUBLIC FUNCTIONS
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_absolute_path:
// ---------------------------------------------------------------------------
/** Replace tilde (~) and environment variable values in a path name and
 * then construct the absolute path name.  Unlike canonicalize, absolutize
 * does not require the file to exist.
 *
 * On any expansion or conversion failure the original path is returned.
 */
pub fn get_absolute_path(path: &str) -> String {
    let s = match shellexpand::full(path) {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };

    let p = Path::new(s.deref());
    let p1 = match p.absolutize() {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };
    match p1.to_str() {
        Some(x) => x.to_owned(),
        None => path.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// get_absolute_path_from:
// ---------------------------------------------------------------------------
/** Like get_absolute_path, but relative paths are anchored at base instead
 * of the process working directory.
 */
pub fn get_absolute_path_from(base: &str, path: &str) -> String {
    let s = match shellexpand::full(path) {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };

    match Path::new(s.deref()).absolutize_from(base) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => path.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// resolve_under:
// ---------------------------------------------------------------------------
/** Join a request path onto a base directory.  Only normal path components
 * are accepted, so the result can never escape the base directory.  Returns
 * None for empty paths or paths containing `..`, a root or a prefix.
 */
pub fn resolve_under(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim_start_matches('/'));
    let mut out = base.to_path_buf();
    let mut pushed = false;
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => {
                out.push(c);
                pushed = true;
            },
            Component::CurDir => (),
            _ => return None,
        }
    }
    if pushed {Some(out)} else {None}
}

// ---------------------------------------------------------------------------
// timestamp_utc:
// ---------------------------------------------------------------------------
/** Get the current UTC timestamp */
pub fn timestamp_utc() -> DateTime<Utc> {
    Utc::now()
}

// ---------------------------------------------------------------------------
// timestamp_utc_to_str:
// ---------------------------------------------------------------------------
/** Convert a UTC datetime to rfc3339 format with microsecond precision, which
 * looks like this:  2022-09-13T14:14:42.719849Z
 */
pub fn timestamp_utc_to_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ***************************************************************************
//                              Monotonic Clock
// ***************************************************************************
/** Generates strictly increasing record timestamps.  When the wall clock has
 * not advanced past the last issued value (same microsecond, or the clock
 * stepped backwards) the last value is bumped by one microsecond instead.
 */
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, already formatted as a store key.
    pub fn next_key(&mut self) -> String {
        timestamp_utc_to_str(self.next_at(timestamp_utc()))
    }

    fn next_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        // Keys carry microseconds, so compare at that resolution.
        let now = truncate_micros(now);
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.timestamp_subsec_nanos();
    ts - Duration::nanoseconds((nanos % 1_000) as i64)
}

// ***************************************************************************
//                                  Traits
// ***************************************************************************
pub trait RequestDebug {
    fn get_request_info(&self) -> String;
}

// ---------------------------------------------------------------------------
// debug_request:
// ---------------------------------------------------------------------------
// Dump http request information to the log.
pub fn debug_request(http_req: &Request, req: Option<&dyn RequestDebug>) {
    // Check that debug or higher logging is in effect.
    if log::max_level() < LevelFilter::Debug {
        return;
    }

    let mut s = "\n".to_string();
    let uri = http_req.uri();
    s += format!("  {} {:?}\n", http_req.method(), uri).as_str();

    for v in http_req.headers().iter() {
         s += format!("  Header: {} = {:?} \n", v.0, v.1).as_str();
    };

    if let Some(q) = uri.query() {
        s += format!("  Query Parameters: {:?}\n", q).as_str();
    }

    if let Some(req) = req {
        s += req.get_request_info().as_str();
    }

    debug!("{}", s);
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clock_is_strictly_increasing_on_ties() {
        let mut clock = MonotonicClock::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 30).unwrap();
        let a = clock.next_at(t);
        let b = clock.next_at(t);
        let c = clock.next_at(t - Duration::seconds(5));
        assert!(a < b && b < c);
        assert_eq!(timestamp_utc_to_str(b), "2024-05-01T10:20:30.000001Z");
    }

    #[test]
    fn clock_keys_sort_lexically() {
        let mut clock = MonotonicClock::new();
        let keys: Vec<String> = (0..100).map(|_| clock.next_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn resolve_rejects_escapes() {
        let base = Path::new("/srv/www");
        assert_eq!(resolve_under(base, "/css/site.css"), Some(PathBuf::from("/srv/www/css/site.css")));
        assert_eq!(resolve_under(base, "./logo.png"), Some(PathBuf::from("/srv/www/logo.png")));
        assert_eq!(resolve_under(base, "../etc/passwd"), None);
        assert_eq!(resolve_under(base, "a/../../b"), None);
        assert_eq!(resolve_under(base, ""), None);
    }

    #[test]
    fn absolute_path_expands_relative() {
        let p = get_absolute_path("storage/data.json");
        assert!(Path::new(&p).is_absolute());
        assert!(p.ends_with("storage/data.json"));
    }
}
