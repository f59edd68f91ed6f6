//! Page features used to decide whether a homepage belongs to a personal blog.

use std::collections::HashSet;
use std::sync::LazyLock;

use bloglink_core::domain_of;
use bloglink_storage::store::clamp_name;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use url::Url;

const TEXT_SAMPLE_CHARS: usize = 800;
const MAX_ARTICLE_LINKS: usize = 15;
const MAX_NAV_LINKS: usize = 10;

static TITLE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*[-|]\s*(博客|Blog|首页|Home).*$").expect("valid title suffix regex")
});
static FEED_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(rss|xml|atom)(\?|$)|/feed|/rss|/atom").expect("valid feed regex")
});
static POST_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(post|posts|article|articles|blog|entry|p|archives|archive)/")
        .expect("valid post href regex")
});
static POST_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)post|article|entry").expect("valid post class regex"));
static NAV_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)nav|menu|header").expect("valid nav class regex"));

const FEED_WORDS: &[&str] = &["rss", "feed", "atom", "订阅", "subscribe"];
const NAV_WORDS: &[&str] = &[
    "博客", "blog", "文章", "post", "archive", "归档", "分类", "category", "标签", "tag", "目录",
    "关于", "about", "友链", "friend", "链接", "link", "留言", "comment", "评论", "guestbook",
];
const BLOG_NAV_WORDS: &[&str] = &[
    "blog", "博客", "文章", "post", "archive", "归档", "分类", "category", "标签", "tag",
];
const NOT_ARTICLE_WORDS: &[&str] = &[
    "首页", "home", "关于", "about", "联系", "contact", "登录", "login", "注册", "register",
];
const BLOG_WORDS: &[&str] = &[
    "博客", "blog", "文章", "post", "archive", "归档", "分类", "category", "标签", "tag", "评论",
    "comment", "留言", "rss", "feed", "atom", "订阅", "subscribe", "最新文章", "recent posts",
    "发布时间", "publish", "author", "作者", "上一篇", "下一篇", "previous", "next",
];

/// What a judge gets to see about a candidate homepage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SiteSummary {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<String>,
    /// Visible body text, whitespace-collapsed and cut to 800 characters.
    pub text_sample: String,
    pub feeds: Vec<String>,
    /// `text -> href` for links that look like posts.
    pub article_links: Vec<String>,
    pub navigation: Vec<String>,
    pub category_count: usize,
    pub tag_count: usize,
    pub article_elements: usize,
    pub time_elements: usize,
    pub post_containers: usize,
    pub blog_vocabulary: bool,
}

impl SiteSummary {
    pub fn post_count(&self) -> usize {
        self.article_links.len()
    }

    /// Plain-text rendering handed to the language model.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let mut line = |label: &str, value: &str| {
            if !value.is_empty() {
                out.push_str(label);
                out.push_str(": ");
                out.push_str(value);
                out.push('\n');
            }
        };
        line("URL", &self.url);
        line("Title", self.title.as_deref().unwrap_or_default());
        line("Description", self.description.as_deref().unwrap_or_default());
        line("Keywords", self.keywords.as_deref().unwrap_or_default());
        line("Feeds", &self.feeds.join(", "));
        line("Navigation", &self.navigation.join("; "));
        line("Post-like links", &self.article_links.join("; "));
        line(
            "Structure",
            &format!(
                "{} <article>, {} <time datetime>, {} post containers, {} category links, {} tag links",
                self.article_elements,
                self.time_elements,
                self.post_containers,
                self.category_count,
                self.tag_count
            ),
        );
        line("Text sample", &self.text_sample);
        out
    }
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static css selector")
}

fn collapse(text: impl Iterator<Item = impl AsRef<str>>) -> String {
    let mut out = String::new();
    for chunk in text {
        for word in chunk.as_ref().split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
    }
    out
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse(el.text())
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn meta_content(document: &Html, name: &str) -> Option<String> {
    document
        .select(&sel("meta[name][content]"))
        .find(|m| {
            m.value()
                .attr("name")
                .is_some_and(|n| n.to_ascii_lowercase().contains(name))
        })
        .and_then(|m| m.value().attr("content"))
        .map(|c| collapse(std::iter::once(c)))
        .and_then(non_empty)
}

fn class_matches(el: ElementRef<'_>, re: &Regex) -> bool {
    el.value().attr("class").is_some_and(|c| re.is_match(c))
}

/// Body text without script, style and noscript contents.
fn visible_text(document: &Html) -> String {
    let Some(body) = document.select(&sel("body")).next() else {
        return String::new();
    };
    let chunks = body.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript"))
        });
        (!hidden).then_some(&**text)
    });
    collapse(chunks)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

pub fn summarize(html: &str, page_url: &str) -> SiteSummary {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let resolve = |href: &str| match &base {
        Some(base) => base.join(href).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
        None => href.to_string(),
    };

    let title = document
        .select(&sel("title"))
        .next()
        .map(element_text)
        .and_then(non_empty);
    let description = meta_content(&document, "description");
    let keywords = meta_content(&document, "keywords");

    let mut feeds: Vec<String> = Vec::new();
    let mut push_feed = |url: String| {
        if !feeds.contains(&url) {
            feeds.push(url);
        }
    };
    for link in document.select(&sel("link[href][type]")) {
        let kind = link.value().attr("type").unwrap_or_default().to_ascii_lowercase();
        if kind.contains("rss") || kind.contains("atom") {
            push_feed(resolve(link.value().attr("href").unwrap_or_default()));
        }
    }
    let anchors = sel("a[href]");
    for a in document.select(&anchors) {
        let href = a.value().attr("href").unwrap_or_default();
        let text = element_text(a).to_lowercase();
        if FEED_HREF.is_match(href) || contains_any(&text, FEED_WORDS) {
            push_feed(resolve(href));
        }
    }

    let mut navigation = Vec::new();
    let mut seen_nav = HashSet::new();
    for container in document.select(&sel("nav, ul[class], div[class], header")) {
        let name = container.value().name();
        if !(name == "nav" || name == "header" || class_matches(container, &NAV_CLASS)) {
            continue;
        }
        for a in container.select(&anchors) {
            let text = element_text(a).to_lowercase();
            if contains_any(&text, NAV_WORDS) {
                let entry = format!("{text} -> {}", a.value().attr("href").unwrap_or_default());
                if seen_nav.insert(entry.clone()) {
                    navigation.push(entry);
                }
            }
        }
    }
    navigation.truncate(MAX_NAV_LINKS);

    let mut article_links = Vec::new();
    let mut seen_hrefs = HashSet::new();
    let mut push_article = |a: ElementRef<'_>, min_chars: usize, filter_nav: bool| {
        let href = a.value().attr("href").unwrap_or_default();
        let text = element_text(a);
        if href.is_empty() || text.chars().count() <= min_chars {
            return;
        }
        if filter_nav && contains_any(&text.to_lowercase(), NOT_ARTICLE_WORDS) {
            return;
        }
        if seen_hrefs.insert(href.to_string()) {
            let short: String = text.chars().take(50).collect();
            article_links.push(format!("{short} -> {href}"));
        }
    };
    for article in document.select(&sel("article")).take(20) {
        for a in article.select(&anchors) {
            push_article(a, 5, false);
        }
    }
    let post_divs: Vec<ElementRef<'_>> = document
        .select(&sel("div[class]"))
        .filter(|d| {
            d.value()
                .attr("class")
                .is_some_and(|c| POST_CLASS.is_match(c) || c.to_ascii_lowercase().contains("blog"))
        })
        .collect();
    for div in post_divs.iter().take(30) {
        for a in div.select(&anchors) {
            push_article(a, 5, true);
        }
    }
    for a in document
        .select(&anchors)
        .filter(|a| POST_HREF.is_match(a.value().attr("href").unwrap_or_default()))
        .take(30)
    {
        push_article(a, 3, false);
    }
    for a in document.select(&sel("h1 a[href], h2 a[href], h3 a[href], h4 a[href], h5 a[href], h6 a[href]")) {
        push_article(a, 5, false);
    }
    article_links.truncate(MAX_ARTICLE_LINKS);

    let mut categories = HashSet::new();
    let mut tags = HashSet::new();
    for a in document.select(&anchors) {
        let href = a.value().attr("href").unwrap_or_default().to_ascii_lowercase();
        let class = a.value().attr("class").unwrap_or_default().to_ascii_lowercase();
        let text = element_text(a);
        if text.is_empty() {
            continue;
        }
        if href.contains("/category") || href.contains("/categories") || class.contains("category") {
            categories.insert(text);
        } else if href.contains("/tag") || class.contains("tag") {
            tags.insert(text);
        }
    }

    let text_sample: String = visible_text(&document)
        .chars()
        .take(TEXT_SAMPLE_CHARS)
        .collect();
    let vocabulary_source = format!(
        "{} {} {}",
        title.as_deref().unwrap_or_default(),
        description.as_deref().unwrap_or_default(),
        text_sample
    )
    .to_lowercase();

    SiteSummary {
        url: page_url.to_string(),
        blog_vocabulary: contains_any(&vocabulary_source, BLOG_WORDS),
        title,
        description,
        keywords,
        text_sample,
        feeds,
        article_links,
        navigation,
        category_count: categories.len().min(10),
        tag_count: tags.len().min(20),
        article_elements: document.select(&sel("article")).count(),
        time_elements: document.select(&sel("time[datetime]")).count(),
        post_containers: post_divs.iter().filter(|d| class_matches(**d, &POST_CLASS)).count(),
    }
}

/// Weighted feature score out of 100.
pub fn feature_score(summary: &SiteSummary) -> u32 {
    let mut score = match summary.post_count() {
        n if n >= 5 => 30,
        n if n >= 3 => 20,
        n if n >= 1 => 10,
        _ => 0,
    };
    if !summary.feeds.is_empty() {
        score += 20;
    }
    if summary.category_count > 0 || summary.tag_count > 0 {
        score += 20;
    }
    if summary.article_elements > 0 || summary.post_containers > 0 {
        score += 15;
    } else if summary.time_elements > 0 {
        score += 10;
    }
    let nav = summary.navigation.join(" ").to_lowercase();
    if contains_any(&nav, BLOG_NAV_WORDS) {
        score += 10;
    }
    if summary.blog_vocabulary {
        score += 5;
    }
    score
}

pub const FEATURE_SCORE_MAX: u32 = 100;
pub const FEATURE_BLOG_RATIO: f64 = 0.4;

pub fn looks_like_blog(summary: &SiteSummary) -> bool {
    f64::from(feature_score(summary)) / f64::from(FEATURE_SCORE_MAX) >= FEATURE_BLOG_RATIO
}

/// Display name when the judge offers none: the page title without a
/// trailing "- Blog" / "| Home" part, else the capitalized first domain label.
pub fn fallback_site_name(title: Option<&str>, url: &str) -> String {
    if let Some(title) = title {
        let stripped = TITLE_SUFFIX.replace(title.trim(), "");
        let stripped = stripped.trim();
        if !stripped.is_empty() {
            return clamp_name(stripped);
        }
    }
    let domain = domain_of(url).unwrap_or_else(|_| url.to_string());
    let label = domain.split('.').next().unwrap_or_default();
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => domain,
    }
}
