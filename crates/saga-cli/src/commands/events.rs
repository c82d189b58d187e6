//! `saga events` - print one page of a campaign's events.

use anyhow::{Context, Result};
use clap::Args;
use saga_core::Event;
use saga_core::config::SagaConfig;
use saga_core::context::CallContext;
use saga_core::pagination::{CursorDir, Page, PageCursor, PageFilter, PageRequest};
use serde::Serialize;

use super::{Access, open_store, print_json};

/// Arguments for `saga events`.
#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Campaign to list
    pub campaign_id: String,

    /// Only events after this sequence
    #[arg(long, default_value_t = 0)]
    pub after: u64,

    /// Events per page (clamped to 1..=200)
    #[arg(long, default_value_t = saga_core::pagination::DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Newest first
    #[arg(long)]
    pub desc: bool,

    /// Only events of this session
    #[arg(long)]
    pub session: Option<String>,

    /// Continue from this sequence
    #[arg(long)]
    pub cursor: Option<u64>,

    /// Cursor direction (fwd or bwd)
    #[arg(long, default_value = "fwd")]
    pub cursor_dir: String,

    /// Fetch the page before the cursor
    #[arg(long)]
    pub reverse: bool,
}

impl EventsArgs {
    pub fn to_request(&self) -> Result<PageRequest> {
        let cursor = match self.cursor {
            Some(seq) => Some(PageCursor {
                seq,
                dir: self.cursor_dir.parse::<CursorDir>()?,
            }),
            None => None,
        };
        Ok(PageRequest {
            campaign_id: self.campaign_id.clone(),
            after_seq: self.after,
            page_size: self.page_size,
            cursor,
            cursor_reverse: self.reverse,
            descending: self.desc,
            filter: self.session.as_deref().map(PageFilter::session),
        })
    }
}

/// An event with its payload decoded for display.
#[derive(Debug, Serialize)]
pub struct EventView<'a> {
    #[serde(flatten)]
    pub event: &'a Event,
    pub payload: serde_json::Value,
}

impl<'a> EventView<'a> {
    pub fn new(event: &'a Event) -> Self {
        let payload = serde_json::from_slice(&event.payload_json).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&event.payload_json).into_owned())
        });
        Self { event, payload }
    }
}

/// A page plus the cursors that fetch its neighbours.
#[derive(Debug, Serialize)]
pub struct PageView<'a> {
    pub events: Vec<EventView<'a>>,
    pub total_count: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    /// `--cursor` value for the next page.
    pub next_cursor: Option<u64>,
    /// `--cursor` value (with `--reverse`) for the previous page.
    pub prev_cursor: Option<u64>,
}

impl<'a> PageView<'a> {
    pub fn new(page: &'a Page<Event>) -> Self {
        let next_cursor = page
            .items
            .last()
            .filter(|_| page.has_next_page)
            .map(|e| e.seq);
        let prev_cursor = page
            .items
            .first()
            .filter(|_| page.has_prev_page)
            .map(|e| e.seq);
        Self {
            events: page.items.iter().map(EventView::new).collect(),
            total_count: page.total_count,
            has_next_page: page.has_next_page,
            has_prev_page: page.has_prev_page,
            next_cursor,
            prev_cursor,
        }
    }
}

pub fn run(config: &SagaConfig, args: &EventsArgs) -> Result<()> {
    let request = args.to_request()?;
    let store = open_store(config, Access::Read)?;
    let page = store
        .list_events_page(&CallContext::background(), &request)
        .with_context(|| format!("failed to list events of {}", args.campaign_id))?;
    print_json(&PageView::new(&page))
}
