use axum::{
    body::Body,
    extract::{ConnectInfo, Extension, Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::video::{self, VideoStatus};
use crate::error::{AppError, AppResult};
use crate::token::TokenKeys;

#[derive(Debug, Deserialize)]
pub struct PlaybackParams {
    pub token: Option<String>,
}

/// Address of the viewer. Forwarding headers are only believed when the TCP
/// peer is one of `trusted_proxies`; otherwise the peer itself is the client.
pub fn client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted_proxies.contains(&peer) {
        return Some(peer);
    }

    let header_ip = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    // Right-most hop that is not one of our proxies.
    if let Some(forwarded) = header_ip("x-forwarded-for") {
        let hop = forwarded
            .rsplit(',')
            .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
            .find(|hop| !trusted_proxies.contains(hop));
        if hop.is_some() {
            return hop;
        }
    }
    header_ip("x-real-ip")
        .and_then(|v| v.trim().parse().ok())
        .or(Some(peer))
}

/// Outcome of a `Range` request header against a file of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Resolve a single `bytes=` range. Multi-range and malformed headers are
/// ignored and the whole file is served.
pub fn resolve_range(range: Option<&str>, len: u64) -> ByteRange {
    let Some(spec) = range.and_then(|r| r.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the last N bytes.
        return match last.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if len == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            },
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
        start,
        end: end.map_or(len - 1, |end| end.min(len - 1)),
    }
}

/// Stream a processed video. Requires an embed token issued for this video.
/// Honors single `Range` requests so the player can seek.
pub async fn serve_video(
    Extension(db): Extension<DatabaseConnection>,
    Extension(keys): Extension<TokenKeys>,
    Extension(config): Extension<Arc<AppConfig>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(video_id): Path<Uuid>,
    Query(params): Query<PlaybackParams>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let token = params
        .token
        .ok_or_else(|| AppError::Unauthorized("Playback token missing".to_string()))?;
    keys.verify_embed(&token, video_id).map_err(|e| {
        tracing::debug!("Rejected embed token for {}: {}", video_id, e);
        AppError::Unauthorized("Invalid or expired playback token".to_string())
    })?;

    let video = video::Entity::find_by_id(video_id)
        .one(&db)
        .await?
        .ok_or(AppError::NotFound("Video"))?;
    let processed_path = match (&video.processed_file_path, video.status.as_str()) {
        (Some(path), status) if status == VideoStatus::Processed.as_str() => path.clone(),
        _ => return Err(AppError::NotFound("Video")),
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let ip = client_ip(peer, &headers, &config.trusted_proxies);
    if !video.security_options().allows_ip(ip) {
        tracing::Span::current()
            .record("action", "serve_video_rejected")
            .record("error", "ip_not_allowed");
        return Err(AppError::Forbidden("Playback not allowed from this address".to_string()));
    }

    let mut file = tokio::fs::File::open(&processed_path).await.map_err(|e| {
        tracing::error!("Processed file {} unreadable: {}", processed_path, e);
        AppError::NotFound("Video")
    })?;
    let file_size = file.metadata().await?.len();

    tracing::Span::current()
        .record("video_id", tracing::field::display(video_id))
        .record("action", "serve_video");
    metrics::counter!("secureteach_playbacks_total").increment(1);

    let content_type = mime_guess::from_path(&processed_path)
        .first_or_octet_stream()
        .to_string();
    let common = [
        (header::CONTENT_TYPE, content_type),
        (header::ACCEPT_RANGES, "bytes".to_string()),
        (header::CACHE_CONTROL, "private, no-store".to_string()),
        (header::CONTENT_DISPOSITION, "inline".to_string()),
    ];

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let response = match resolve_range(range, file_size) {
        ByteRange::Full => (
            StatusCode::OK,
            common,
            [(header::CONTENT_LENGTH, file_size.to_string())],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        ByteRange::Partial { start, end } => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            (
                StatusCode::PARTIAL_CONTENT,
                common,
                [
                    (header::CONTENT_LENGTH, length.to_string()),
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{file_size}")),
                ],
                Body::from_stream(ReaderStream::new(file.take(length))),
            )
                .into_response()
        }
        ByteRange::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{file_size}"))],
        )
            .into_response(),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip")
    }

    #[test]
    fn forwarded_headers_from_untrusted_peers_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.5"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.5"));

        let resolved = client_ip(Some(ip("198.51.100.20")), &headers, &[]);
        assert_eq!(resolved, Some(ip("198.51.100.20")));

        let restricted = crate::entities::video::SecurityOptions {
            restrict_ip_access: true,
            allowed_ips: vec!["10.0.0.5".to_string()],
            ..Default::default()
        };
        assert!(!restricted.allows_ip(resolved));
    }

    #[test]
    fn trusted_proxy_forwards_the_client_address() {
        let proxy = ip("10.0.0.1");
        let mut headers = HeaderMap::new();
        // The left-most entry is client supplied; the proxy appended the real peer.
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.5, 203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(Some(proxy), &headers, &[proxy]), Some(ip("203.0.113.7")));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_ip(Some(proxy), &headers, &[proxy]), Some(ip("203.0.113.9")));

        assert_eq!(client_ip(Some(proxy), &HeaderMap::new(), &[proxy]), Some(proxy));
        assert_eq!(client_ip(None, &headers, &[proxy]), None);
    }

    #[test]
    fn ranges_resolve_against_file_length() {
        assert_eq!(resolve_range(None, 100), ByteRange::Full);
        assert_eq!(
            resolve_range(Some("bytes=0-9"), 100),
            ByteRange::Partial { start: 0, end: 9 }
        );
        assert_eq!(
            resolve_range(Some("bytes=90-"), 100),
            ByteRange::Partial { start: 90, end: 99 }
        );
        assert_eq!(
            resolve_range(Some("bytes=50-500"), 100),
            ByteRange::Partial { start: 50, end: 99 }
        );
        assert_eq!(
            resolve_range(Some("bytes=-10"), 100),
            ByteRange::Partial { start: 90, end: 99 }
        );
        assert_eq!(resolve_range(Some("bytes=100-"), 100), ByteRange::Unsatisfiable);
        assert_eq!(resolve_range(Some("bytes=-0"), 100), ByteRange::Unsatisfiable);
        assert_eq!(resolve_range(Some("bytes=0-1,5-9"), 100), ByteRange::Full);
        assert_eq!(resolve_range(Some("bytes=9-2"), 100), ByteRange::Full);
        assert_eq!(resolve_range(Some("items=0-1"), 100), ByteRange::Full);
    }
}
