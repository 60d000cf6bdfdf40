//! Declarative service metadata published for documentation tooling.
//!
//! The document is static configuration; nothing in the filter chain reads or
//! computes it.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub openapi: String,
    pub info: Info,
    pub external_docs: ExternalDocs,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Info {
    pub title: String,
    pub description: String,
    pub version: String,
    pub contact: Contact,
    pub license: License,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct License {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalDocs {
    pub description: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub url: String,
    pub description: String,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            openapi: "3.0.1".to_string(),
            info: Info {
                title: "Personal Finance API Gateway".to_string(),
                description: "API Gateway for User Auth, Transactions, and Analytics services"
                    .to_string(),
                version: "v1".to_string(),
                contact: Contact {
                    name: "Dev Team".to_string(),
                    email: "dev@example.com".to_string(),
                },
                license: License {
                    name: "Apache 2.0".to_string(),
                    url: "https://www.apache.org/licenses/LICENSE-2.0".to_string(),
                },
            },
            external_docs: ExternalDocs {
                description: "Project Docs".to_string(),
                url: "https://example.com/docs".to_string(),
            },
            servers: vec![Server {
                url: "/".to_string(),
                description: "Gateway Server".to_string(),
            }],
        }
    }
}
