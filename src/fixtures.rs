//! Shared test entity

use crate::resource::{Meta, Resource};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Widget {
    pub metadata: Meta,
    pub spec: WidgetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WidgetStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct WidgetSpec {
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct WidgetStatus {
    pub ready: bool,
}

impl Resource for Widget {
    fn kind() -> &'static str {
        "Widget"
    }

    fn group() -> &'static str {
        "example.dev"
    }

    fn version() -> &'static str {
        "v1"
    }

    fn meta(&self) -> &Meta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.metadata
    }
}

pub(crate) fn widget(uid: &str, name: &str, resource_version: &str) -> Widget {
    Widget {
        metadata: Meta {
            name: name.into(),
            uid: uid.into(),
            resource_version: resource_version.into(),
            ..Meta::default()
        },
        spec: WidgetSpec {
            content: "original".into(),
        },
        status: None,
    }
}
