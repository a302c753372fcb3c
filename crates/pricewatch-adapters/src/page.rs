//! Product page signal extraction.

use pricewatch_core::{assess_block, normalize_price, normalize_text, BlockAssessment, ExtractionResult, SoftBlockSignals};
use scraper::{Html, Selector};

use crate::TierError;

const PRODUCT_TITLE: &str = "#productTitle";
const ADD_TO_CART_BUTTON: &str = "#add-to-cart-button";
const BUY_NOW_BUTTON: &str = "#buy-now-button";
const CAPTCHA_FORM: &str = r#"form[action="/errors/validateCaptcha"]"#;
const HIDDEN_PRICE_VALUE: &str = "input#priceValue";
const PAGE_TITLE: &str = "title";
const PAGE_BODY: &str = "body";

/// Checked in order; the first non-empty text decides the price.
const PRIMARY_PRICE: [&str; 5] = [
    "#corePriceDisplay_desktop_feature_div .a-price .a-offscreen",
    "#corePrice_feature_div .a-price .a-offscreen",
    "#corePrice_desktop .a-price .a-offscreen",
    "#apex_desktop .apex-core-price-identifier .a-price .a-offscreen",
    "#tp_price_block_total_price_ww .a-offscreen",
];

/// Block verdict plus extracted data for one fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAnalysis {
    pub assessment: BlockAssessment,
    pub extraction: ExtractionResult,
}

/// Run every block detector over a fetched page; blocked pages yield a blocked
/// extraction with no data.
pub fn analyze_page(status: Option<u16>, html: &str) -> Result<PageAnalysis, TierError> {
    let page = ProductPage::parse(html);
    let assessment = page.assess(status)?;
    let extraction = if assessment.is_blocked() {
        ExtractionResult::blocked()
    } else {
        page.extract()?
    };
    Ok(PageAnalysis {
        assessment,
        extraction,
    })
}

pub struct ProductPage {
    document: Html,
}

impl ProductPage {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    pub fn extract(&self) -> Result<ExtractionResult, TierError> {
        let title = self.first_text(PRODUCT_TITLE)?;
        let in_stock = self.exists(ADD_TO_CART_BUTTON)? || self.exists(BUY_NOW_BUTTON)?;
        Ok(ExtractionResult {
            price: self.primary_price()?,
            in_stock,
            title,
            blocked: false,
        })
    }

    pub fn primary_price(&self) -> Result<Option<String>, TierError> {
        for selector in PRIMARY_PRICE {
            if let Some(text) = self.first_text(selector)? {
                return Ok(normalize_price(Some(&text)));
            }
        }
        let hidden = self.first_attr(HIDDEN_PRICE_VALUE, "value")?;
        Ok(normalize_price(hidden.as_deref()))
    }

    pub fn has_captcha_form(&self) -> Result<bool, TierError> {
        self.exists(CAPTCHA_FORM)
    }

    pub fn soft_block_signals(&self) -> Result<SoftBlockSignals, TierError> {
        Ok(SoftBlockSignals {
            title_text: self.first_text(PAGE_TITLE)?,
            body_text: self.first_text(PAGE_BODY)?,
            has_product_title: self.exists(PRODUCT_TITLE)?,
            has_primary_price: self.primary_price()?.is_some(),
            has_add_to_cart: self.exists(ADD_TO_CART_BUTTON)?,
            has_buy_now: self.exists(BUY_NOW_BUTTON)?,
        })
    }

    pub fn assess(&self, status: Option<u16>) -> Result<BlockAssessment, TierError> {
        Ok(assess_block(
            status,
            self.has_captcha_form()?,
            &self.soft_block_signals()?,
        ))
    }

    fn exists(&self, selector: &str) -> Result<bool, TierError> {
        let sel = parse_selector(selector)?;
        Ok(self.document.select(&sel).next().is_some())
    }

    fn first_text(&self, selector: &str) -> Result<Option<String>, TierError> {
        let sel = parse_selector(selector)?;
        Ok(self
            .document
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(&n.text().collect::<String>())))
    }

    fn first_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, TierError> {
        let sel = parse_selector(selector)?;
        Ok(self
            .document
            .select(&sel)
            .next()
            .and_then(|n| n.value().attr(attr))
            .and_then(text_or_none))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, TierError> {
    Selector::parse(selector).map_err(|e| TierError::Message(format!("selector {selector:?}: {e}")))
}

fn text_or_none(value: &str) -> Option<String> {
    let normalized = normalize_text(value);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
