use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use sruth_core::{ArchivePath, Filter, PathPattern, Predicate};

/// A subscriber's standing order: which trackers to ask and which files to
/// pull.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub trackers: Vec<SocketAddr>,
    pub predicate: Predicate,
}

/// Loads a subscription file:
///
/// ```xml
/// <subscription>
///   <tracker host="localhost" port="38800"/>
///   <predicate>
///     <filter type="prefix" path="data/model"/>
///   </predicate>
/// </subscription>
/// ```
///
/// `<filter>` is one of `type="everything"`, `type="prefix" path="…"`, or
/// `type="pattern" regex="…"`. Only exactly this shape is accepted.
pub fn load_subscription(path: &Path) -> Result<Subscription> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("couldn't read subscription file {}", path.display()))?;
    parse_subscription(&text)
        .with_context(|| format!("invalid subscription file {}", path.display()))
}

fn parse_subscription(text: &str) -> Result<Subscription> {
    if !text.contains("<subscription>") || !text.contains("</subscription>") {
        bail!("missing <subscription> element");
    }

    let tracker_re = Regex::new(r#"<tracker\s+host="([^"]+)"\s+port="([^"]+)"\s*/>"#)
        .expect("tracker pattern compiles");
    let mut trackers = Vec::new();
    for captures in tracker_re.captures_iter(text) {
        let host = &captures[1];
        let port: u16 = captures[2]
            .parse()
            .with_context(|| format!("invalid tracker port {:?}", &captures[2]))?;
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("couldn't resolve tracker host {host:?}"))?
            .next()
            .ok_or_else(|| anyhow!("tracker host {host:?} resolved to no address"))?;
        trackers.push(addr);
    }
    if trackers.is_empty() {
        bail!("subscription names no tracker");
    }

    let filter_re =
        Regex::new(r#"<filter\s+type="([a-z]+)"(?:\s+(path|regex)="([^"]*)")?\s*/>"#)
            .expect("filter pattern compiles");
    let mut filters = Vec::new();
    for captures in filter_re.captures_iter(text) {
        let filter = match (&captures[1], captures.get(2).map(|m| m.as_str())) {
            ("everything", None) => Filter::Everything,
            ("prefix", Some("path")) => {
                let path = ArchivePath::new(&captures[3])
                    .with_context(|| format!("invalid filter path {:?}", &captures[3]))?;
                Filter::Prefix(path)
            }
            ("pattern", Some("regex")) => {
                let pattern = PathPattern::new(&captures[3])
                    .with_context(|| format!("invalid filter regex {:?}", &captures[3]))?;
                Filter::Pattern(pattern)
            }
            (kind, _) => bail!("unsupported filter: {kind:?}"),
        };
        filters.push(filter);
    }
    if filters.is_empty() {
        bail!("subscription predicate names no filter");
    }

    Ok(Subscription {
        trackers,
        predicate: Predicate::new(filters),
    })
}

#[cfg(test)]
mod tests {
    use sruth_core::{ArchivePath, Filter};

    use super::parse_subscription;

    #[test]
    fn parses_trackers_and_filters() {
        let subscription = parse_subscription(
            r#"<subscription>
                 <tracker host="127.0.0.1" port="38800"/>
                 <predicate>
                   <filter type="prefix" path="data/model"/>
                   <filter type="pattern" regex="\.nc$"/>
                 </predicate>
               </subscription>"#,
        )
        .unwrap();
        assert_eq!(subscription.trackers.len(), 1);
        assert_eq!(subscription.predicate.filters().len(), 2);
        assert_eq!(
            subscription.predicate.filters()[0],
            Filter::Prefix(ArchivePath::new("data/model").unwrap())
        );
    }

    #[test]
    fn everything_filter() {
        let subscription = parse_subscription(
            r#"<subscription>
                 <tracker host="127.0.0.1" port="38800"/>
                 <predicate><filter type="everything"/></predicate>
               </subscription>"#,
        )
        .unwrap();
        assert!(subscription
            .predicate
            .matches(&ArchivePath::new("any/file").unwrap()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_subscription("<subscription></subscription>").is_err());
        assert!(parse_subscription(
            r#"<subscription>
                 <tracker host="127.0.0.1" port="38800"/>
                 <predicate><filter type="glob"/></predicate>
               </subscription>"#
        )
        .is_err());
    }
}
