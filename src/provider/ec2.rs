//! AWS EC2 provider: signed `DescribeInstances` over the query API.
//!
//! Each region gets its own client. Responses are XML; the decoder walks
//! `reservationSet/item/instancesSet/item` and follows `nextToken` until
//! the listing is exhausted.

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::sigv4::{self, SignableRequest};
use super::{Connector, Instance, InstanceSource, ProviderError};
use crate::config::Credentials;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Connector ───────────────────────────────────────────────────────

pub struct Ec2Connector {
    client: reqwest::Client,
}

impl Ec2Connector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Connector for Ec2Connector {
    fn connect(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn InstanceSource>, ProviderError> {
        if region.is_empty() || !region.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProviderError::Connect(format!("invalid region name '{}'", region)));
        }
        Ok(Arc::new(Ec2Client {
            client: self.client.clone(),
            region: region.to_string(),
            host: format!("ec2.{}.amazonaws.com", region),
            credentials: credentials.clone(),
        }))
    }
}

// ── Client ──────────────────────────────────────────────────────────

pub struct Ec2Client {
    client: reqwest::Client,
    region: String,
    host: String,
    credentials: Credentials,
}

impl Ec2Client {
    async fn describe_page(
        &self,
        next_token: Option<&str>,
    ) -> Result<(Vec<Instance>, Option<String>), ProviderError> {
        let mut body = format!("Action=DescribeInstances&Version={}", API_VERSION);
        if let Some(token) = next_token {
            body.push_str("&NextToken=");
            body.push_str(&sigv4::uri_encode(token));
        }

        let now = Utc::now();
        let amz_date = sigv4::amz_date(now);
        let signable = SignableRequest {
            method: "POST",
            path: "/",
            query: "",
            headers: vec![
                ("content-type", CONTENT_TYPE.to_string()),
                ("host", self.host.clone()),
                ("x-amz-date", amz_date),
            ],
            payload: body.as_bytes(),
        };
        let signature = sigv4::sign(&signable, &self.credentials, &self.region, SERVICE, now);

        let resp = self
            .client
            .post(format!("https://{}/", self.host))
            .timeout(REQUEST_TIMEOUT)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header("authorization", signature.authorization)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(parse_error_response(status.as_u16(), &text));
        }

        parse_describe_instances(&text)
    }
}

#[async_trait]
impl InstanceSource for Ec2Client {
    async fn describe_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let (page, token) = self.describe_page(next_token.as_deref()).await?;
            instances.extend(page);
            pages += 1;
            match token {
                Some(t) if !t.is_empty() => next_token = Some(t),
                _ => break,
            }
        }

        debug!(
            region = %self.region,
            pages = pages,
            instances = instances.len(),
            "DescribeInstances complete"
        );
        Ok(instances)
    }
}

// ── Response Parsing ────────────────────────────────────────────────

/// Element path (below the root) of one instance record.
const INSTANCE_PATH: [&str; 4] = ["reservationSet", "item", "instancesSet", "item"];

fn at_instance(rel: &[String]) -> bool {
    rel.len() == INSTANCE_PATH.len() && rel.iter().zip(INSTANCE_PATH).all(|(a, b)| a == b)
}

/// The part of `rel` below the instance record, if inside one.
fn instance_field(rel: &[String]) -> Option<Vec<&str>> {
    if rel.len() > INSTANCE_PATH.len() && at_instance(&rel[..INSTANCE_PATH.len()]) {
        Some(rel[INSTANCE_PATH.len()..].iter().map(String::as_str).collect())
    } else {
        None
    }
}

#[derive(Default)]
struct TagBuilder {
    key: Option<String>,
    value: Option<String>,
}

/// Decode one `DescribeInstancesResponse` page into instances and the
/// pagination token.
pub fn parse_describe_instances(
    xml: &str,
) -> Result<(Vec<Instance>, Option<String>), ProviderError> {
    // Untrimmed, so tag values keep their whitespace; other fields are
    // trimmed in `set_text`.
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();

    // Element names from the root down; rel = path[1..].
    let mut path: Vec<String> = Vec::new();
    let mut instances = Vec::new();
    let mut current: Option<Instance> = None;
    let mut tag: Option<TagBuilder> = None;
    let mut next_token = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                path.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                open_element(&path, &mut current, &mut tag);
            }
            Ok(Event::Empty(empty)) => {
                // `<value/>` is a tag with an empty value.
                path.push(String::from_utf8_lossy(empty.local_name().as_ref()).into_owned());
                open_element(&path, &mut current, &mut tag);
                set_text(&path, String::new(), &mut current, &mut tag, &mut next_token);
                close_element(&path, &mut current, &mut tag, &mut instances);
                path.pop();
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| ProviderError::Decode(e.to_string()))?
                    .into_owned();
                set_text(&path, text, &mut current, &mut tag, &mut next_token);
            }
            Ok(Event::End(_)) => {
                close_element(&path, &mut current, &mut tag, &mut instances);
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProviderError::Decode(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok((instances, next_token))
}

fn open_element(path: &[String], current: &mut Option<Instance>, tag: &mut Option<TagBuilder>) {
    let rel = rel_path(path);
    if at_instance(rel) {
        *current = Some(Instance::default());
        return;
    }
    if current.is_none() {
        return;
    }
    match instance_field(rel).as_deref() {
        Some(["tagSet", "item"]) => *tag = Some(TagBuilder::default()),
        // A present `<value>` element is never null, even with no text.
        Some(["tagSet", "item", "value"]) => {
            if let Some(builder) = tag.as_mut() {
                builder.value = Some(String::new());
            }
        }
        _ => {}
    }
}

fn close_element(
    path: &[String],
    current: &mut Option<Instance>,
    tag: &mut Option<TagBuilder>,
    instances: &mut Vec<Instance>,
) {
    let rel = rel_path(path);
    if at_instance(rel) {
        if let Some(instance) = current.take() {
            instances.push(instance);
        }
    } else if instance_field(rel).as_deref() == Some(&["tagSet", "item"][..]) {
        if let (Some(builder), Some(instance)) = (tag.take(), current.as_mut()) {
            if let Some(key) = builder.key {
                instance.tags.insert(key, builder.value);
            }
        }
    }
}

fn set_text(
    path: &[String],
    text: String,
    current: &mut Option<Instance>,
    tag: &mut Option<TagBuilder>,
    next_token: &mut Option<String>,
) {
    let rel = rel_path(path);
    if rel == ["nextToken"] {
        *next_token = Some(text.trim().to_string());
        return;
    }

    let (Some(field), Some(instance)) = (instance_field(rel), current.as_mut()) else {
        return;
    };

    if field.as_slice() == ["tagSet", "item", "value"] {
        if let Some(builder) = tag.as_mut() {
            builder.value.get_or_insert_with(String::new).push_str(&text);
        }
        return;
    }

    let text = text.trim().to_string();
    match field.as_slice() {
        ["instanceId"] => instance.id = text,
        ["imageId"] => instance.image_id = Some(text),
        ["instanceType"] => instance.instance_type = Some(text),
        ["instanceState", "name"] => instance.state = text,
        ["tagSet", "item", "key"] => {
            if let Some(builder) = tag.as_mut() {
                builder.key = Some(text);
            }
        }
        _ => {}
    }
}

fn rel_path(path: &[String]) -> &[String] {
    if path.is_empty() {
        path
    } else {
        &path[1..]
    }
}

/// Extract `Response/Errors/Error/{Code,Message}` from an error body.
pub fn parse_error_response(status: u16, body: &str) -> ProviderError {
    let mut reader = XmlReader::from_str(body);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut element = String::new();
    let mut code = None;
    let mut message = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                element = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
            }
            Ok(Event::Text(text)) => {
                let text = text.unescape().map(|t| t.into_owned()).unwrap_or_default();
                match element.as_str() {
                    "Code" if code.is_none() => code = Some(text),
                    "Message" if message.is_none() => message = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => element.clear(),
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    ProviderError::Api {
        status,
        code: code.unwrap_or_else(|| "Unknown".to_string()),
        message: message.unwrap_or_else(|| body.chars().take(500).collect()),
    }
}
