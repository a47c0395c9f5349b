//! Result set management (XEP-0059).
//!
//! Pages over an ordered row set using opaque anchor ids. `max=0` asks for
//! the count only; `after`/`before` anchor a forward or backward page
//! strictly past the named row.

use minidom::Element;

use crate::stanza::ns;

/// A parsed RSM request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsmQuery {
    /// Page size; `None` is unlimited.
    pub max: Option<usize>,
    /// Forward page anchor: results start strictly after this id.
    pub after: Option<String>,
    /// Backward page anchor: results end strictly before this id. An
    /// empty string asks for the last page.
    pub before: Option<String>,
}

/// An RSM reply summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsmReply {
    /// Id of the first row in the page; absent when the page is empty.
    pub first: Option<String>,
    /// Id of the last row in the page; absent when the page is empty.
    pub last: Option<String>,
    /// Index of the first row within the full set.
    pub index: Option<usize>,
    /// Total size of the full set.
    pub count: usize,
}

/// Parse the `<set/>` child of a query element, if any.
pub fn parse_rsm(parent: &Element) -> RsmQuery {
    let mut query = RsmQuery::default();
    let Some(set) = parent.get_child("set", ns::RSM) else {
        return query;
    };
    for child in set.children() {
        match child.name() {
            "max" => query.max = child.text().trim().parse().ok(),
            "after" => {
                let text = child.text();
                if !text.is_empty() {
                    query.after = Some(text);
                }
            }
            "before" => {
                // an empty <before/> means "last page"
                query.before = Some(child.text());
            }
            _ => {}
        }
    }
    query
}

/// Build the `<set/>` reply element.
pub fn build_rsm_reply(reply: &RsmReply) -> Element {
    let mut set = Element::builder("set", ns::RSM);
    if let Some(first) = &reply.first {
        let mut first_elem = Element::builder("first", ns::RSM).append(first.as_str());
        if let Some(index) = reply.index {
            first_elem = first_elem.attr("index", index.to_string());
        }
        set = set.append(first_elem.build());
    }
    if let Some(last) = &reply.last {
        set = set.append(Element::builder("last", ns::RSM).append(last.as_str()).build());
    }
    set = set.append(
        Element::builder("count", ns::RSM)
            .append(reply.count.to_string())
            .build(),
    );
    set.build()
}

/// Apply RSM to rows of (id, value), returning the selected page and the
/// reply summary.
pub fn paginate<T: Clone>(rows: &[(String, T)], query: &RsmQuery) -> (Vec<T>, RsmReply) {
    let mut reply = RsmReply {
        count: rows.len(),
        ..RsmReply::default()
    };

    // count only
    if query.max == Some(0) {
        return (Vec::new(), reply);
    }

    let mut page = Vec::new();
    match &query.before {
        None => {
            // forward page
            let mut after_reached = query.after.is_none();
            for (i, (id, value)) in rows.iter().enumerate() {
                if query.max.is_some_and(|max| page.len() >= max) {
                    break;
                }
                if !after_reached {
                    if Some(id) == query.after.as_ref() {
                        after_reached = true;
                    }
                    continue;
                }
                if page.is_empty() {
                    reply.first = Some(id.clone());
                    reply.index = Some(i);
                }
                reply.last = Some(id.clone());
                page.push(value.clone());
            }
        }
        Some(before) => {
            // backward page
            let mut before_reached = before.is_empty();
            for (i, (id, value)) in rows.iter().enumerate().rev() {
                if query.max.is_some_and(|max| page.len() >= max) {
                    break;
                }
                if !before_reached {
                    if id == before {
                        before_reached = true;
                    }
                    continue;
                }
                if page.is_empty() {
                    reply.last = Some(id.clone());
                }
                reply.first = Some(id.clone());
                reply.index = Some(i);
                page.insert(0, value.clone());
            }
        }
    }
    (page, reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<(String, usize)> {
        (0..n).map(|i| (format!("id{i}"), i)).collect()
    }

    #[test]
    fn count_only() {
        let rows = rows(7);
        let (page, reply) = paginate(
            &rows,
            &RsmQuery {
                max: Some(0),
                ..RsmQuery::default()
            },
        );
        assert!(page.is_empty());
        assert_eq!(reply.count, 7);
        assert_eq!(reply.first, None);
        assert_eq!(reply.last, None);
    }

    #[test]
    fn forward_page_after_anchor() {
        let rows = rows(5);
        let (page, reply) = paginate(
            &rows,
            &RsmQuery {
                max: Some(2),
                after: Some("id1".to_string()),
                before: None,
            },
        );
        assert_eq!(page, vec![2, 3]);
        assert_eq!(reply.first.as_deref(), Some("id2"));
        assert_eq!(reply.last.as_deref(), Some("id3"));
        assert_eq!(reply.index, Some(2));
        assert_eq!(reply.count, 5);
    }

    #[test]
    fn backward_page_before_anchor() {
        let rows = rows(5);
        let (page, reply) = paginate(
            &rows,
            &RsmQuery {
                max: Some(2),
                after: None,
                before: Some("id3".to_string()),
            },
        );
        assert_eq!(page, vec![1, 2]);
        assert_eq!(reply.first.as_deref(), Some("id1"));
        assert_eq!(reply.last.as_deref(), Some("id2"));
        assert_eq!(reply.index, Some(1));
    }

    #[test]
    fn empty_before_means_last_page() {
        let rows = rows(5);
        let (page, reply) = paginate(
            &rows,
            &RsmQuery {
                max: Some(2),
                after: None,
                before: Some(String::new()),
            },
        );
        assert_eq!(page, vec![3, 4]);
        assert_eq!(reply.first.as_deref(), Some("id3"));
        assert_eq!(reply.last.as_deref(), Some("id4"));
    }

    #[test]
    fn empty_page_has_no_anchors() {
        let rows = rows(3);
        let (page, reply) = paginate(
            &rows,
            &RsmQuery {
                max: Some(5),
                after: Some("id2".to_string()),
                before: None,
            },
        );
        assert!(page.is_empty());
        assert_eq!(reply.first, None);
        assert_eq!(reply.last, None);
        assert_eq!(reply.index, None);
        assert_eq!(reply.count, 3);
    }

    #[test]
    fn unlimited_returns_everything() {
        let rows = rows(4);
        let (page, reply) = paginate(&rows, &RsmQuery::default());
        assert_eq!(page, vec![0, 1, 2, 3]);
        assert_eq!(reply.index, Some(0));
    }

    #[test]
    fn parse_and_reply_round_trip() {
        let parent = Element::builder("list", crate::stanza::ns::ARCHIVE)
            .append(
                Element::builder("set", ns::RSM)
                    .append(Element::builder("max", ns::RSM).append("10").build())
                    .append(Element::builder("after", ns::RSM).append("abc").build())
                    .build(),
            )
            .build();
        let query = parse_rsm(&parent);
        assert_eq!(query.max, Some(10));
        assert_eq!(query.after.as_deref(), Some("abc"));
        assert_eq!(query.before, None);

        let reply = RsmReply {
            first: Some("a".to_string()),
            last: Some("b".to_string()),
            index: Some(3),
            count: 12,
        };
        let elem = build_rsm_reply(&reply);
        assert_eq!(
            elem.get_child("first", ns::RSM).and_then(|f| f.attr("index")),
            Some("3")
        );
        assert_eq!(
            elem.get_child("count", ns::RSM).map(|c| c.text()),
            Some("12".to_string())
        );
    }
}
