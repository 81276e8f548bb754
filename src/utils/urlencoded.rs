#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::utils::errors::Errors;

// ***************************************************************************
//                                Submission
// ***************************************************************************
/** The decoded key/value pairs of one form post, in body order.  Keys may
 * repeat; folding into a field map keeps the last value.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pairs: Vec<(String, String)>,
}

impl Submission {
    // ---------------------------------------------------------------------------
    // parse:
    // ---------------------------------------------------------------------------
    /** Decode a raw application/x-www-form-urlencoded body.  The body is split
     * into `&` segments and each segment on its first `=` before anything is
     * decoded, so escaped separators survive inside keys and values.
     */
    pub fn parse(raw: &[u8]) -> Result<Submission, Errors> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Errors::MalformedSubmission(format!("body is not UTF-8: {}", e)))?;

        // Forms post a single line.
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return Err(Errors::MalformedSubmission("empty body".to_string()));
        }

        let mut pairs = Vec::new();
        for segment in text.split('&') {
            if segment.is_empty() {continue;}
            let (k, v) = match segment.split_once('=') {
                Some(kv) => kv,
                None => {
                    let msg = format!("segment '{}' has no '='", segment);
                    return Err(Errors::MalformedSubmission(msg));
                }
            };
            let key = decode_component(k)?;
            if key.is_empty() {
                let msg = format!("segment '{}' has an empty key", segment);
                return Err(Errors::MalformedSubmission(msg));
            }
            pairs.push((key, decode_component(v)?));
        }

        if pairs.is_empty() {
            return Err(Errors::MalformedSubmission("no key/value pairs".to_string()));
        }
        Ok(Submission {pairs})
    }

    /// The pairs in body order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Fold into a field map, the last value for a repeated key wins.
    pub fn into_fields(self) -> BTreeMap<String, String> {
        self.pairs.into_iter().collect()
    }
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
fn decode_component(s: &str) -> Result<String, Errors> {
    let plus_decoded = s.replace('+', " ");
    match urlencoding::decode(&plus_decoded) {
        Ok(c) => Ok(c.into_owned()),
        Err(e) => Err(Errors::MalformedSubmission(format!("'{}' does not decode to UTF-8: {}", s, e))),
    }
}

// ***************************************************************************
//                                 Encoding
// ***************************************************************************
// Only tests build bodies from pairs.
#[cfg(test)]
impl Submission {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {pairs}
    }

    /** Re-encode the pairs as a form body. */
    pub fn encode(&self) -> String {
        self.pairs.iter()
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
            .collect::<Vec<String>>()
            .join("&")
    }
}

#[cfg(test)]
fn encode_component(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(v: &[(&str, &str)]) -> Vec<(String, String)> {
        v.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_plus_and_percent() {
        let s = Submission::parse(b"name=Jane+Doe&age=30").unwrap();
        assert_eq!(s.pairs(), pairs(&[("name", "Jane Doe"), ("age", "30")]).as_slice());

        let s = Submission::parse(b"msg=caf%C3%A9+%26+cr%C3%AApes%3D%2B").unwrap();
        assert_eq!(s.pairs(), pairs(&[("msg", "café & crêpes=+")]).as_slice());
    }

    #[test]
    fn ignores_trailing_newline_and_empty_segments() {
        let s = Submission::parse(b"a=1&&b=\r\n").unwrap();
        assert_eq!(s.pairs(), pairs(&[("a", "1"), ("b", "")]).as_slice());
    }

    #[test]
    fn value_may_contain_raw_equals() {
        let s = Submission::parse(b"expr=a=b").unwrap();
        assert_eq!(s.pairs(), pairs(&[("expr", "a=b")]).as_slice());
    }

    #[test]
    fn rejects_malformed_bodies() {
        let bodies: [&[u8]; 8] = [b"", b"\n", b"&&", b"novalue", b"a=1&oops", b"=x", b"a=\xff\xfe", b"a=%FF"];
        for body in bodies {
            match Submission::parse(body) {
                Err(Errors::MalformedSubmission(_)) => (),
                other => panic!("{:?} parsed as {:?}", body, other),
            }
        }
    }

    #[test]
    fn invalid_escape_is_kept_literally() {
        let s = Submission::parse(b"pct=100%&x=%zz").unwrap();
        assert_eq!(s.pairs(), pairs(&[("pct", "100%"), ("x", "%zz")]).as_slice());
    }

    #[test]
    fn last_value_wins_when_folded() {
        let fields = Submission::parse(b"color=red&size=m&color=blue").unwrap().into_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["color"], "blue");
        assert_eq!(fields["size"], "m");
    }

    #[test]
    fn decode_encode_decode_is_stable() {
        let bodies: [&[u8]; 6] = [
            b"name=Jane+Doe&age=30",
            b"q=rust%20lang&lang=en",
            b"x=%26%3D%2B&y=plain",
            b"emoji=%F0%9F%A6%80&e=",
            b"dup=1&dup=2",
            b"path=%2Fhome%2Fuser+dir",
        ];
        for body in bodies {
            let first = Submission::parse(body).unwrap();
            let again = Submission::parse(first.encode().as_bytes()).unwrap();
            assert_eq!(first, again, "body {:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn encode_uses_form_escaping() {
        let s = Submission::new(pairs(&[("full name", "A&B"), ("n", "1+1")]));
        assert_eq!(s.encode(), "full+name=A%26B&n=1%2B1");
    }
}
