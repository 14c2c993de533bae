//! Binds a viewer to tracing spans, log fields and metric tags.

use std::collections::BTreeMap;

use http::HeaderMap;
use http::header::USER_AGENT;
use tracing::Span;

use super::Viewer;
use super::header_str;
use crate::context::Context;

/// Attribute recording the viewer's tenant.
pub const TENANT_ATTRIBUTE: &str = "viewer.tenant";
/// Attribute recording the viewer's user.
pub const USER_ATTRIBUTE: &str = "viewer.user";
/// Attribute recording the viewer's role.
pub const ROLE_ATTRIBUTE: &str = "viewer.role";
/// Tag recording the caller's declared user agent.
pub const USER_AGENT_ATTRIBUTE: &str = "viewer.user_agent";

/// Counter of requests resolved to a viewer.
pub const REQUESTS_METRIC: &str = "tenant_viewer_requests_total";

/// Tags exported as metric labels, with their label names. User and user
/// agent stay out: one series per email or browser string is unbounded.
const METRIC_LABELS: [(&str, &str); 2] = [
    (TENANT_ATTRIBUTE, "tenant"),
    (ROLE_ATTRIBUTE, "role"),
];

/// Register descriptions for the metrics recorded by this module.
pub fn describe_metrics() {
    metrics::describe_counter!(
        REQUESTS_METRIC,
        "Total number of requests resolved to a viewer"
    );
}

/// Metric tags of a request. Keys are unique; upserts replace values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<&'static str, String>);

impl TagSet {
    /// Insert or replace a tag.
    pub fn upsert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    /// Get a tag value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Low-cardinality subset of the tags, as `metrics` labels.
    pub fn metric_labels(&self) -> Vec<metrics::Label> {
        METRIC_LABELS
            .iter()
            .filter_map(|(tag, label)| {
                self.get(tag)
                    .map(|value| metrics::Label::new(*label, value.to_string()))
            })
            .collect()
    }
}

/// A single upsert applied to a [`TagSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMutation {
    pub key: &'static str,
    pub value: String,
}

impl TagMutation {
    pub fn upsert(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

#[derive(Clone)]
struct TagsSlot(TagSet);

/// Span carrying the viewer attributes.
///
/// Events emitted while the span is entered carry tenant, user and role as
/// named fields.
pub fn viewer_span(viewer: &Viewer) -> Span {
    tracing::info_span!(
        "viewer",
        viewer.tenant = %viewer.tenant(),
        viewer.user = %viewer.user(),
        viewer.role = %viewer.role(),
    )
}

/// Tag upserts for `viewer` and the request's user agent.
pub fn tag_mutations(viewer: &Viewer, headers: &HeaderMap) -> Vec<TagMutation> {
    vec![
        TagMutation::upsert(TENANT_ATTRIBUTE, viewer.tenant()),
        TagMutation::upsert(USER_ATTRIBUTE, viewer.user()),
        TagMutation::upsert(ROLE_ATTRIBUTE, viewer.role()),
        TagMutation::upsert(USER_AGENT_ATTRIBUTE, header_str(headers, USER_AGENT.as_str())),
    ]
}

/// Get the tag set of `ctx`; empty when none was attached.
pub fn tags_from_context(ctx: &Context) -> TagSet {
    ctx.value::<TagsSlot>()
        .map(|slot| slot.0.clone())
        .unwrap_or_default()
}

/// Count a resolved request, labelled from the tags of `ctx`.
pub fn count_request(ctx: &Context) {
    metrics::counter!(REQUESTS_METRIC, tags_from_context(ctx).metric_labels()).increment(1);
}

/// Return a child of `ctx` with `mutations` applied to its tag set.
pub fn with_tags(ctx: &Context, mutations: impl IntoIterator<Item = TagMutation>) -> Context {
    let mut tags = tags_from_context(ctx);
    for mutation in mutations {
        tags.upsert(mutation.key, mutation.value);
    }
    ctx.with_value(TagsSlot(tags))
}

/// Bind `viewer` to the diagnostics of the current request.
///
/// Returns the tagged child context and the span downstream handling
/// should run in.
pub fn bind(ctx: &Context, viewer: &Viewer, headers: &HeaderMap) -> (Context, Span) {
    let ctx = with_tags(ctx, tag_mutations(viewer, headers));
    (ctx, viewer_span(viewer))
}
