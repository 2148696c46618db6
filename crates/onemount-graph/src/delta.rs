//! Incremental delta queries
//!
//! Implements the delta query pattern: an initial call without a cursor
//! enumerates the drive; each response's `@odata.deltaLink` carries an opaque
//! token identifying the ingested change set, and subsequent calls with that
//! token return only what changed since.
//!
//! A 410 Gone response means the token expired server-side; the caller must
//! clear its cursor and perform a full resync.

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use onemount_core::ports::DeltaPage;
use onemount_core::DeltaCursor;

use crate::client::GraphClient;
use crate::items::{to_remote_item, GraphDriveItem};
use crate::GraphError;

/// Path for the delta endpoint relative to the Graph API base URL.
const DELTA_PATH: &str = "/me/drive/root/delta";

/// Raw response from the delta endpoint.
#[derive(Debug, Deserialize)]
struct GraphDeltaResponse {
    #[serde(default)]
    value: Vec<GraphDriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Extracts the opaque token from a deltaLink URL.
///
/// The link looks like
/// `https://graph.microsoft.com/v1.0/me/drive/root/delta?token=...`;
/// only the token parameter is persisted as the cursor.
pub fn extract_cursor(delta_link: &str) -> Option<DeltaCursor> {
    let parsed = url::Url::parse(delta_link).ok()?;
    let token = parsed
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())?;
    DeltaCursor::new(token).ok()
}

/// Fetches all delta changes since `cursor`, following pagination.
///
/// Returns the accumulated items in server order and the cursor from the
/// final page's deltaLink.
pub async fn get_delta(
    client: &GraphClient,
    cursor: Option<&DeltaCursor>,
) -> Result<DeltaPage, GraphError> {
    let path = match cursor {
        Some(c) => format!("{}?token={}", DELTA_PATH, c.as_str()),
        None => DELTA_PATH.to_string(),
    };
    debug!(has_cursor = cursor.is_some(), "Starting delta query");

    let mut raw: GraphDeltaResponse = client
        .send_checked(client.request(Method::GET, &path))
        .await?
        .json()
        .await?;

    let mut page = DeltaPage::default();
    let mut pages = 1u32;
    loop {
        for item in raw.value.drain(..) {
            page.items.push(to_remote_item(item)?);
        }
        if let Some(delta_link) = raw.delta_link.take() {
            page.cursor = extract_cursor(&delta_link);
            break;
        }
        let Some(next) = raw.next_link.take() else {
            break;
        };
        pages += 1;
        debug!(page = pages, "Following delta nextLink");
        raw = client
            .send_checked(client.request_absolute(Method::GET, &next))
            .await?
            .json()
            .await?;
    }

    if page.cursor.is_none() {
        warn!("Delta query completed without a deltaLink; next sync may re-enumerate");
    }
    debug!(
        items = page.items.len(),
        pages,
        has_cursor = page.cursor.is_some(),
        "Delta query complete"
    );
    Ok(page)
}
