//! Content loading for the local index backend.
//!
//! Turns a [`LoaderSource`] into one or more plain-text documents:
//!
//! | Source | Loading |
//! |--------|---------|
//! | file | PDF/DOCX/PPTX via [`crate::extract`], anything else as lossy UTF-8 |
//! | url | HTTP GET; HTML reduced to visible text |
//! | sitemap | every `<loc>` fetched as a url (one level of `<sitemapindex>` is followed) |
//! | note | the text itself |
//!
//! Sitemap pages that fail to load are logged and skipped; a sitemap that
//! yields no page at all is an error.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use quick_xml::events::Event;
use std::path::Path;
use std::time::Duration;

use crate::backend::LoaderSource;
use crate::config::FetchConfig;
use crate::extract::{extract_text, DocumentFormat};

/// Pages fetched concurrently while expanding a sitemap.
const SITEMAP_FETCH_CONCURRENCY: usize = 4;

/// Elements whose text never reaches the index.
const INVISIBLE_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDocument {
    pub source: String,
    pub text: String,
}

pub struct SourceLoader {
    client: reqwest::Client,
    max_sitemap_pages: usize,
}

impl SourceLoader {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_sitemap_pages: config.max_sitemap_pages,
        })
    }

    pub async fn load(&self, source: &LoaderSource) -> Result<Vec<LoadedDocument>> {
        match source {
            LoaderSource::File(path) => Ok(vec![load_file(path).await?]),
            LoaderSource::Url(url) => Ok(vec![self.load_url(url).await?]),
            LoaderSource::Sitemap(url) => self.load_sitemap(url).await,
            LoaderSource::Note { text, .. } => Ok(vec![LoadedDocument {
                source: source.describe(),
                text: text.clone(),
            }]),
        }
    }

    async fn fetch(&self, url: &str) -> Result<(String, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;
        Ok((content_type, body))
    }

    async fn load_url(&self, url: &str) -> Result<LoadedDocument> {
        let (content_type, body) = self.fetch(url).await?;
        let text = if content_type.contains("html") || looks_like_html(&body) {
            html_to_text(&body)
        } else {
            body
        };
        Ok(LoadedDocument {
            source: url.to_string(),
            text,
        })
    }

    async fn load_sitemap(&self, url: &str) -> Result<Vec<LoadedDocument>> {
        let (_, xml) = self.fetch(url).await?;
        let mut sitemap = parse_sitemap(&xml)?;

        if sitemap.is_index {
            let mut pages = Vec::new();
            for child in sitemap.locations {
                if pages.len() >= self.max_sitemap_pages {
                    break;
                }
                match self.fetch(&child).await.and_then(|(_, x)| parse_sitemap(&x)) {
                    Ok(nested) if !nested.is_index => pages.extend(nested.locations),
                    Ok(_) => tracing::warn!(sitemap = %child, "nested sitemap index skipped"),
                    Err(e) => tracing::warn!(sitemap = %child, error = %e, "child sitemap failed"),
                }
            }
            sitemap.locations = pages;
        }

        sitemap.locations.truncate(self.max_sitemap_pages);
        if sitemap.locations.is_empty() {
            bail!("Sitemap {} lists no pages", url);
        }

        let total = sitemap.locations.len();
        let docs: Vec<LoadedDocument> = stream::iter(sitemap.locations)
            .map(|page| async move {
                match self.load_url(&page).await {
                    Ok(doc) => Some(doc),
                    Err(e) => {
                        tracing::warn!(page = %page, error = %e, "sitemap page skipped");
                        None
                    }
                }
            })
            .buffered(SITEMAP_FETCH_CONCURRENCY)
            .filter_map(|doc| async move { doc })
            .collect()
            .await;

        if docs.is_empty() {
            bail!("None of the {} pages in sitemap {} could be loaded", total, url);
        }
        Ok(docs)
    }
}

pub async fn load_file(path: &Path) -> Result<LoadedDocument> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let text = match DocumentFormat::from_path(path) {
        Some(format) => extract_text(&bytes, format)?,
        None => String::from_utf8_lossy(&bytes).into_owned(),
    };
    Ok(LoadedDocument {
        source: path.display().to_string(),
        text,
    })
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(64).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Visible text of an HTML page, one line per text node.
pub fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let mut lines: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|el| INVISIBLE_ELEMENTS.contains(&el.name()))
                .unwrap_or(false)
        });
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }
    lines.join("\n")
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sitemap {
    pub is_index: bool,
    pub locations: Vec<String>,
}

/// Collect `<loc>` entries of a `<urlset>` or `<sitemapindex>` document.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut sitemap = Sitemap::default();
    let mut in_loc = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"sitemapindex" => sitemap.is_index = true,
                b"loc" => in_loc = true,
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"loc" => in_loc = false,
            Event::Text(t) if in_loc => {
                let loc = t.unescape()?.trim().to_string();
                if !loc.is_empty() {
                    sitemap.locations.push(loc);
                }
            }
            Event::CData(c) if in_loc => {
                let loc = String::from_utf8_lossy(&c).trim().to_string();
                if !loc.is_empty() {
                    sitemap.locations.push(loc);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sitemap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_to_text_skips_scripts_and_styles() {
        let html = r#"<!DOCTYPE html><html><head><title>T</title><style>p{color:red}</style></head>
            <body><h1>Heading</h1><script>var x = 1;</script><p>Body <b>text</b></p></body></html>"#;
        let text = html_to_text(html);
        assert_eq!(text, "Heading\nBody\ntext");
    }

    #[test]
    fn detects_html_without_content_type() {
        assert!(looks_like_html("  <!DOCTYPE html><html></html>"));
        assert!(looks_like_html("<HTML><body/></HTML>"));
        assert!(!looks_like_html("plain words"));
    }

    #[test]
    fn parses_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.com/a</loc><lastmod>2024-01-01</lastmod></url>
              <url><loc> https://example.com/b?x=1&amp;y=2 </loc></url>
            </urlset>"#;
        let sitemap = parse_sitemap(xml).unwrap();
        assert!(!sitemap.is_index);
        assert_eq!(
            sitemap.locations,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b?x=1&y=2".to_string()
            ]
        );
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex><sitemap><loc>https://example.com/s1.xml</loc></sitemap></sitemapindex>"#;
        let sitemap = parse_sitemap(xml).unwrap();
        assert!(sitemap.is_index);
        assert_eq!(sitemap.locations, vec!["https://example.com/s1.xml".to_string()]);
    }

    #[tokio::test]
    async fn load_note_and_plain_file() {
        let loader = SourceLoader::new(&FetchConfig::default()).unwrap();
        let docs = loader
            .load(&LoaderSource::Note {
                text: "remember the milk".into(),
                source: None,
            })
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "remember the milk");

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.md");
        std::fs::write(&path, "# Title\n\nBody").unwrap();
        let docs = loader.load(&LoaderSource::File(path)).await.unwrap();
        assert_eq!(docs[0].text, "# Title\n\nBody");
    }
}
