//! What to execute: finished MDX or a stored view

use cubist_http::{odata_quote, Request};
use serde_json::json;
use std::fmt;

/// Source of a cellset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// Finished query text, e.g. from a query composer
    Mdx(String),
    /// A named view on a cube
    View {
        cube: String,
        view: String,
        private: bool,
    },
}

impl QuerySource {
    pub fn mdx(text: impl Into<String>) -> Self {
        QuerySource::Mdx(text.into())
    }

    pub fn view(cube: impl Into<String>, view: impl Into<String>) -> Self {
        QuerySource::View {
            cube: cube.into(),
            view: view.into(),
            private: false,
        }
    }

    pub fn private_view(cube: impl Into<String>, view: impl Into<String>) -> Self {
        QuerySource::View {
            cube: cube.into(),
            view: view.into(),
            private: true,
        }
    }

    /// The call that allocates a cellset for this source.
    pub(crate) fn create_request(&self) -> Request {
        match self {
            QuerySource::Mdx(mdx) => Request::post("ExecuteMDX").json_value(json!({ "MDX": mdx })),
            QuerySource::View {
                cube,
                view,
                private,
            } => {
                let collection = if *private { "PrivateViews" } else { "Views" };
                Request::post(format!(
                    "Cubes('{}')/{}('{}')/tm1.Execute",
                    odata_quote(cube),
                    collection,
                    odata_quote(view)
                ))
                .json_value(json!({}))
            }
        }
    }
}

impl fmt::Display for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySource::Mdx(mdx) => {
                let first_line = mdx.lines().next().unwrap_or_default();
                write!(f, "mdx:{}", first_line.trim())
            }
            QuerySource::View {
                cube,
                view,
                private,
            } => write!(
                f,
                "{}view:{}/{}",
                if *private { "private " } else { "" },
                cube,
                view
            ),
        }
    }
}
