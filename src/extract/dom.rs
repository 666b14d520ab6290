// src/extract/dom.rs
//! Small DOM capability interface the two-phase extractor is written
//! against: select, attribute, text, parent. One implementation wraps the
//! `scraper` parser; the browser tier feeds the same implementation with
//! its serialized rendered DOM.

use scraper::{ElementRef, Html, Selector};
use tracing::warn;

pub trait DomNode<'a>: Sized + Copy {
    fn select(&self, selector: &str) -> Vec<Self>;
    fn attr(&self, name: &str) -> Option<&'a str>;
    fn text_content(&self) -> String;
    fn is_tag(&self, name: &str) -> bool;
    fn parent(&self) -> Option<Self>;
}

pub trait DomBackend {
    type Node<'a>: DomNode<'a>
    where
        Self: 'a;
    fn root(&self) -> Self::Node<'_>;
}

/// `scraper`-backed document.
pub struct HtmlBackend {
    doc: Html,
}

impl HtmlBackend {
    pub fn parse(html: &str) -> Self {
        Self {
            doc: Html::parse_document(html),
        }
    }
}

impl DomBackend for HtmlBackend {
    type Node<'a> = HtmlNode<'a>;

    fn root(&self) -> HtmlNode<'_> {
        HtmlNode {
            el: self.doc.root_element(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct HtmlNode<'a> {
    el: ElementRef<'a>,
}

impl<'a> DomNode<'a> for HtmlNode<'a> {
    fn select(&self, selector: &str) -> Vec<Self> {
        let sel = match Selector::parse(selector) {
            Ok(s) => s,
            Err(_) => {
                // a broken configured selector is a data problem, not a crash
                warn!(target: "extract", selector, "invalid CSS selector");
                return Vec::new();
            }
        };
        self.el.select(&sel).map(|el| HtmlNode { el }).collect()
    }

    fn attr(&self, name: &str) -> Option<&'a str> {
        self.el.value().attr(name)
    }

    fn text_content(&self) -> String {
        self.el.text().collect::<Vec<_>>().join(" ")
    }

    fn is_tag(&self, name: &str) -> bool {
        self.el.value().name().eq_ignore_ascii_case(name)
    }

    fn parent(&self) -> Option<Self> {
        self.el
            .parent()
            .and_then(ElementRef::wrap)
            .map(|el| HtmlNode { el })
    }
}
