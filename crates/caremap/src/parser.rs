use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::types::{CrawledRecord, ServiceType};

pub(crate) const RESULTS_TABLE: &str = "#ltco_info_list";
const RESULT_ROWS: &str = "#ltco_info_list tbody tr";
const FIRST_RESULT_ROW: &str = "#ltco_info_list tbody tr:first-child";
const INFO_CELL: &str = "td#ltcMapList";

static RE_INDEXED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\S+)").expect("invalid regex: indexed name"));

static RE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(서울|부산|대구|인천|광주|대전|울산|세종|경기|강원|충청|충북|충남|전라|전북|전남|경상|경북|경남|제주)[^☎]+",
    )
    .expect("invalid regex: address")
});

static RE_CAPACITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"정원[:\s]*(\d+)").expect("invalid regex: capacity"));

static RE_ADMISSION_CAPACITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"입소정원[:\s]*(\d+)").expect("invalid regex: admission capacity")
});

static RE_HEADCOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"현원[:\s]*(\d+)").expect("invalid regex: headcount"));

static RE_ADMISSION_HEADCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"입소현원[:\s]*(\d+)").expect("invalid regex: admission headcount")
});

static RE_TOTAL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Total\s+\d+\s*\((\d+)\s*/\s*(\d+)\s+page\)").expect("invalid regex: total")
});

static RE_KOREAN_PAGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*/\s*(\d+)\s*페이지").expect("invalid regex: korean page marker")
});

static RE_SCRIPT_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)totalPages?\s*[=:]\s*['"]?(\d+)['"]?|total[_-]?pages?\s*[=:]\s*['"]?(\d+)['"]?"#,
    )
    .expect("invalid regex: script total")
});

static RE_HREF_PAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page[=:](\d+)").expect("invalid regex: href page"));

static RE_LAST_PAGE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)page[=:](\d+)|goPage\((\d+)\)").expect("invalid regex: last page target")
});

/// A pure heuristic over a piece of row text.
pub type TextExtractor<T> = fn(&str) -> Option<T>;

/// Capacity labels, in the order they are tried.
pub const CAPACITY_EXTRACTORS: &[TextExtractor<u32>] = &[capacity, admission_capacity];

/// Headcount labels, in the order they are tried.
pub const HEADCOUNT_EXTRACTORS: &[TextExtractor<u32>] = &[headcount, admission_headcount];

/// Substring rules for the service type. The first rule whose keyword appears in the
/// row text wins, so a row mentioning both 주야간보호 and 치매 is 주야간보호.
pub const SERVICE_TYPE_RULES: &[(&str, ServiceType)] = &[
    ("주야간보호", ServiceType::DayNightCare),
    ("방문요양", ServiceType::HomeVisitCare),
    ("단기보호", ServiceType::ShortTermCare),
    ("치매", ServiceType::DementiaCare),
];

pub(crate) fn elem_text(element: ElementRef) -> String {
    element.text().collect::<String>()
}

pub(crate) fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn first_match<T>(extractors: &[TextExtractor<T>], text: &str) -> Option<T> {
    extractors.iter().find_map(|extract| extract(text))
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn capacity(text: &str) -> Option<u32> {
    capture_u32(&RE_CAPACITY, text)
}

fn admission_capacity(text: &str) -> Option<u32> {
    capture_u32(&RE_ADMISSION_CAPACITY, text)
}

fn headcount(text: &str) -> Option<u32> {
    capture_u32(&RE_HEADCOUNT, text)
}

fn admission_headcount(text: &str) -> Option<u32> {
    capture_u32(&RE_ADMISSION_HEADCOUNT, text)
}

pub fn institution_code(index: u32) -> String {
    format!("LTCO_{:06}", index)
}

/// Splits `"<index>.<name>"` into the derived institution code and the name.
pub fn parse_indexed_name(text: &str) -> Option<(String, String)> {
    let caps = RE_INDEXED_NAME.captures(text)?;
    let index: u32 = caps[1].parse().ok()?;
    let name = caps[2].trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some((institution_code(index), name))
}

pub fn parse_address(text: &str) -> Option<String> {
    RE_ADDRESS
        .find(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn classify_service_type(text: &str) -> ServiceType {
    SERVICE_TYPE_RULES
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, service_type)| *service_type)
        .unwrap_or_default()
}

/// Scans cells in order (a later matching cell overrides an earlier one) and falls
/// back to the whole row when no single cell carries the label.
fn scan_cells(extractors: &[TextExtractor<u32>], cells: &[String], row_text: &str) -> Option<u32> {
    cells
        .iter()
        .filter_map(|cell| first_match(extractors, cell))
        .last()
        .or_else(|| first_match(extractors, row_text))
}

fn parse_row(row: ElementRef, cell_sel: &Selector, info_sel: &Selector) -> Option<CrawledRecord> {
    let info_cell = row.select(info_sel).next()?;
    let info_text = normalize_whitespace(&elem_text(info_cell));

    let (institution_code, name) = parse_indexed_name(&info_text)?;
    let address = parse_address(&info_text).unwrap_or_default();
    let service_type = classify_service_type(&info_text);

    let cells: Vec<String> = row
        .select(cell_sel)
        .map(|cell| normalize_whitespace(&elem_text(cell)))
        .collect();
    let row_text = cells.join(" ");

    let capacity = scan_cells(CAPACITY_EXTRACTORS, &cells, &row_text).unwrap_or(0);
    let current_headcount = scan_cells(HEADCOUNT_EXTRACTORS, &cells, &row_text).unwrap_or(0);

    Some(CrawledRecord {
        institution_code,
        name,
        service_type,
        address,
        capacity,
        current_headcount,
    })
}

/// Extracts every recognisable institution row on a results page. Rows without an
/// info cell or without an `<index>.<name>` marker are skipped.
pub fn parse_institution_rows(html: &str) -> Vec<CrawledRecord> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse(RESULT_ROWS).unwrap();
    let cell_sel = Selector::parse("td").unwrap();
    let info_sel = Selector::parse(INFO_CELL).unwrap();

    document
        .select(&row_sel)
        .enumerate()
        .filter_map(|(i, row)| {
            let record = parse_row(row, &cell_sel, &info_sel);
            if record.is_none() {
                log::debug!(
                    "Skipping row {}: {}",
                    i + 1,
                    normalize_whitespace(&elem_text(row))
                        .chars()
                        .take(80)
                        .collect::<String>()
                );
            }
            record
        })
        .collect()
}

pub fn count_result_rows(html: &str) -> usize {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse(RESULT_ROWS).unwrap();
    document.select(&row_sel).count()
}

pub fn has_results_table(html: &str) -> bool {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse(RESULTS_TABLE).unwrap();
    document.select(&table_sel).next().is_some()
}

pub fn first_row_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let first_sel = Selector::parse(FIRST_RESULT_ROW).unwrap();
    document
        .select(&first_sel)
        .next()
        .map(|row| normalize_whitespace(&elem_text(row)))
}

/// One heuristic for the number of result pages.
type PageCountExtractor = fn(&Html, &str) -> Option<u32>;

const PAGE_COUNT_EXTRACTORS: &[(&str, PageCountExtractor)] = &[
    ("total marker", total_marker_pages),
    ("page marker", korean_page_marker_pages),
    ("script variable", script_total_pages),
    ("page links", max_page_link),
    ("last page control", last_page_control),
];

fn total_marker_pages(_: &Html, html: &str) -> Option<u32> {
    RE_TOTAL_MARKER
        .captures(html)
        .and_then(|caps| caps[2].parse().ok())
}

fn korean_page_marker_pages(_: &Html, html: &str) -> Option<u32> {
    RE_KOREAN_PAGE_MARKER
        .captures(html)
        .and_then(|caps| caps[2].parse().ok())
}

fn script_total_pages(_: &Html, html: &str) -> Option<u32> {
    let caps = RE_SCRIPT_TOTAL.captures(html)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

fn max_page_link(document: &Html, _: &str) -> Option<u32> {
    let link_sel = Selector::parse("a").unwrap();
    document
        .select(&link_sel)
        .filter_map(|link| {
            let text = normalize_whitespace(&elem_text(link));
            let href = link.value().attr("href").unwrap_or("");
            let numeric_text = !text.is_empty() && text.chars().all(|c| c.is_ascii_digit());
            if numeric_text {
                text.parse::<u32>().ok()
            } else if href.contains("page") {
                capture_u32(&RE_HREF_PAGE, href)
            } else {
                None
            }
        })
        .max()
}

fn last_page_control(document: &Html, _: &str) -> Option<u32> {
    let last_sel = Selector::parse(r#"a[title*="마지막"], a[title*="끝"], .last, .end"#).unwrap();
    let control = document.select(&last_sel).next()?;
    let target = format!(
        "{}{}",
        control.value().attr("href").unwrap_or(""),
        control.value().attr("onclick").unwrap_or("")
    );
    let caps = RE_LAST_PAGE_TARGET.captures(&target)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Estimates the total number of result pages from the first page's markup.
/// Heuristics run in priority order; the first positive answer wins. Defaults to 1.
pub fn estimate_total_pages(html: &str) -> u32 {
    let document = Html::parse_document(html);
    PAGE_COUNT_EXTRACTORS
        .iter()
        .find_map(|(label, extract)| {
            extract(&document, html).filter(|n| *n > 0).inspect(|n| {
                log::info!("Total pages from {}: {}", label, n);
            })
        })
        .unwrap_or_else(|| {
            log::warn!("Could not infer total pages, assuming 1");
            1
        })
}
