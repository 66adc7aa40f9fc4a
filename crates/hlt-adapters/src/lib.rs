//! Listing-source contracts + the offer-list HTML adapter.

use hlt_core::Listing;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "hlt-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {0:?}")]
    Selector(String),
}

/// One configured listing source: knows its page URLs and how to extract
/// structured listings from a fetched body.
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// URL of the given 1-based result page.
    fn page_url(&self, page: u32) -> String;

    /// Extracts every well-formed listing from a page body. An empty result
    /// signals the end of pagination; items missing required fields are
    /// dropped rather than failing the page.
    fn extract(&self, body: &str) -> Result<Vec<Listing>, ExtractError>;
}

/// Adapter for offer-list markup: an `article` per offer inside the
/// `#body-container` element, attributes in `offer-item-*` classed nodes.
#[derive(Debug, Clone)]
pub struct OfferListSource {
    source_id: String,
    listing_url: String,
}

impl OfferListSource {
    pub fn new(source_id: impl Into<String>, listing_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url: listing_url.into(),
        }
    }
}

impl ListingSource for OfferListSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            self.listing_url.clone()
        } else if self.listing_url.contains('?') {
            format!("{}&page={page}", self.listing_url)
        } else {
            format!("{}?page={page}", self.listing_url)
        }
    }

    fn extract(&self, body: &str) -> Result<Vec<Listing>, ExtractError> {
        extract_offer_articles(body)
    }
}

struct OfferSelectors {
    container: Selector,
    article: Selector,
    title: Selector,
    link: Selector,
    rooms: Selector,
    price: Selector,
    price_per_m: Selector,
    area: Selector,
}

impl OfferSelectors {
    fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            container: parse_selector("#body-container")?,
            article: parse_selector("article")?,
            title: parse_selector("span.offer-item-title")?,
            link: parse_selector("header.offer-item-header a")?,
            rooms: parse_selector("li.offer-item-rooms")?,
            price: parse_selector("li.offer-item-price")?,
            price_per_m: parse_selector("li.offer-item-price-per-m")?,
            area: parse_selector("li.offer-item-area")?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

fn text_of(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let text = scope
        .select(selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Parses every offer `article` out of a listing page. A body without the
/// offer container yields an empty set (the source's end-of-results page).
pub fn extract_offer_articles(body: &str) -> Result<Vec<Listing>, ExtractError> {
    let selectors = OfferSelectors::new()?;
    let document = Html::parse_document(body);

    let Some(container) = document.select(&selectors.container).next() else {
        return Ok(Vec::new());
    };

    let mut listings = Vec::new();
    for article in container.select(&selectors.article) {
        if let Some(listing) = offer_from_article(article, &selectors) {
            listings.push(listing);
        }
    }
    Ok(listings)
}

fn offer_from_article(article: ElementRef<'_>, selectors: &OfferSelectors) -> Option<Listing> {
    let title = text_of(article, &selectors.title)?;
    let reference = article
        .select(&selectors.link)
        .next()?
        .value()
        .attr("href")?
        .trim()
        .to_string();
    if reference.is_empty() {
        return None;
    }
    let rooms = leading_count(&text_of(article, &selectors.rooms)?)?;
    let price = parse_amount(&text_of(article, &selectors.price)?)?;
    let price_per_area = parse_amount(&text_of(article, &selectors.price_per_m)?)?;
    let area = parse_amount(&text_of(article, &selectors.area)?)?;

    Some(Listing {
        reference,
        title,
        rooms,
        price,
        price_per_area,
        area,
    })
}

/// First digit of a count label such as "3 pokoje".
pub fn leading_count(text: &str) -> Option<u32> {
    text.chars().find_map(|ch| ch.to_digit(10))
}

/// Parses a Polish-formatted amount: space-grouped thousands (regular or
/// non-breaking), comma decimal separator, trailing unit suffix.
/// "500 000 zł" -> 500000.0, "54,5 m²" -> 54.5, "10 000 zł/m²" -> 10000.0.
pub fn parse_amount(text: &str) -> Option<f64> {
    let mut cleaned = String::new();
    let mut seen_separator = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            cleaned.push(ch);
        } else if (ch == ',' || ch == '.') && !cleaned.is_empty() && !seen_separator {
            cleaned.push('.');
            seen_separator = true;
        } else if ch.is_whitespace() {
            continue;
        } else if !cleaned.is_empty() {
            // Unit suffix ends the number.
            break;
        }
    }
    cleaned.trim_end_matches('.').parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_PAGE: &str = r##"
        <html><body>
        <div id="body-container">
          <article>
            <header class="offer-item-header">
              <a href="https://example.com/oferta/mieszkanie-mokotow-12345.html">
                <span class="offer-item-title">Mieszkanie, Mokotów</span>
              </a>
            </header>
            <div class="offer-item-details">
              <ul>
                <li class="offer-item-rooms">3 pokoje</li>
                <li class="offer-item-price">500 000 zł</li>
                <li class="offer-item-price-per-m">9 174 zł/m²</li>
                <li class="offer-item-area">54,5 m²</li>
              </ul>
            </div>
          </article>
          <article>
            <header class="offer-item-header">
              <a href="https://example.com/oferta/kawalerka-wola-67890.html">
                <span class="offer-item-title">Kawalerka, Wola</span>
              </a>
            </header>
            <div class="offer-item-details">
              <ul>
                <li class="offer-item-rooms">1 pokój</li>
                <li class="offer-item-price">320 000 zł</li>
                <li class="offer-item-price-per-m">11 034 zł/m²</li>
                <li class="offer-item-area">29 m²</li>
              </ul>
            </div>
          </article>
        </div>
        </body></html>
    "##;

    #[test]
    fn extracts_every_offer_article() {
        let listings = extract_offer_articles(OFFER_PAGE).unwrap();
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title, "Mieszkanie, Mokotów");
        assert_eq!(
            first.reference,
            "https://example.com/oferta/mieszkanie-mokotow-12345.html"
        );
        assert_eq!(first.rooms, 3);
        assert_eq!(first.price, 500_000.0);
        assert_eq!(first.price_per_area, 9_174.0);
        assert_eq!(first.area, 54.5);

        let second = &listings[1];
        assert_eq!(second.rooms, 1);
        assert_eq!(second.area, 29.0);
    }

    #[test]
    fn body_without_offer_container_yields_no_listings() {
        let listings = extract_offer_articles("<html><body><p>Brak wyników</p></body></html>")
            .unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn article_missing_a_required_field_is_dropped() {
        let page = r##"
            <div id="body-container">
              <article>
                <header class="offer-item-header">
                  <a href="https://example.com/oferta/mieszkanie-1.html">
                    <span class="offer-item-title">Bez ceny</span>
                  </a>
                </header>
                <div class="offer-item-details">
                  <ul>
                    <li class="offer-item-rooms">2 pokoje</li>
                    <li class="offer-item-area">40 m²</li>
                  </ul>
                </div>
              </article>
            </div>
        "##;
        let listings = extract_offer_articles(page).unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn amounts_parse_polish_formats() {
        assert_eq!(parse_amount("500 000 zł"), Some(500_000.0));
        assert_eq!(parse_amount("1 250 000 zł"), Some(1_250_000.0));
        assert_eq!(parse_amount("54,5 m²"), Some(54.5));
        assert_eq!(parse_amount("10 000 zł/m²"), Some(10_000.0));
        assert_eq!(parse_amount("9\u{a0}174 zł/m²"), Some(9_174.0));
        assert_eq!(parse_amount("brak danych"), None);
    }

    #[test]
    fn leading_count_reads_the_room_label() {
        assert_eq!(leading_count("3 pokoje"), Some(3));
        assert_eq!(leading_count("1 pokój"), Some(1));
        assert_eq!(leading_count("pokoje"), None);
    }

    #[test]
    fn page_urls_append_the_page_parameter_after_the_first() {
        let plain = OfferListSource::new("otodom", "https://example.com/sprzedaz");
        assert_eq!(plain.page_url(1), "https://example.com/sprzedaz");
        assert_eq!(plain.page_url(2), "https://example.com/sprzedaz?page=2");

        let with_query = OfferListSource::new("otodom", "https://example.com/sprzedaz?order=desc");
        assert_eq!(
            with_query.page_url(3),
            "https://example.com/sprzedaz?order=desc&page=3"
        );
    }
}
