//! AWS: IMDSv2 for self lookups, the EC2 query API for enumeration.
//!
//! EC2 requests are signed with Signature Version 4 using the instance
//! profile credentials served by IMDS.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use join_structs::structs::CloudProvider;
use log::{debug, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use xmltree::{Element, XMLNode};

use crate::{
    CloudApi,
    error::LookupError,
    http::{self, CONTROL_PLANE_TIMEOUT, METADATA_TIMEOUT},
    identity::{InstanceRecord, RoleSource},
};

const IMDS_URL: &str = "http://169.254.169.254/latest";
const IMDS_TOKEN_TTL_SECONDS: &str = "21600";
const EC2_API_VERSION: &str = "2016-11-15";

const ROLE_TAG: &str = "constellation-role";
const UID_TAG: &str = "constellation-uid";
const INIT_SECRET_HASH_TAG: &str = "constellation-init-secret-hash";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    account_id: String,
    region: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(err) => unreachable!("{err}"),
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 encoding as required for canonical query strings.
fn uri_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (uri_encode(key), uri_encode(value)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Headers of a SigV4 signed GET request without body.
fn sign_get(
    credentials: &RoleCredentials,
    region: &str,
    service: &str,
    host: &str,
    query: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = &credentials.token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "GET\n/\n{query}\n{canonical_headers}\n{signed_headers}\n{}",
        hex::encode(Sha256::digest(b""))
    );

    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    let signing_key = hmac(
        &hmac(
            &hmac(
                &hmac(
                    format!("AWS4{}", credentials.secret_access_key).as_bytes(),
                    &date,
                ),
                region,
            ),
            service,
        ),
        "aws4_request",
    );
    let signature = hex::encode(hmac(&signing_key, &string_to_sign));

    headers.retain(|(name, _)| name != "host");
    headers.push((
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    ));
    headers
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn items<'a>(element: &'a Element, set: &str) -> impl Iterator<Item = &'a Element> {
    element
        .get_child(set)
        .into_iter()
        .flat_map(|set| set.children.iter())
        .filter_map(XMLNode::as_element)
        .filter(|item| item.name == "item")
}

fn convert_instance(instance: &Element) -> InstanceRecord {
    let tags: BTreeMap<String, String> = items(instance, "tagSet")
        .filter_map(|tag| Some((child_text(tag, "key")?, child_text(tag, "value")?)))
        .collect();
    let id = child_text(instance, "instanceId");
    let zone = instance
        .get_child("placement")
        .and_then(|placement| child_text(placement, "availabilityZone"));
    if id.is_none() || zone.is_none() {
        warn!("EC2 instance without ID or availability zone");
    }
    InstanceRecord {
        provider_id: id
            .zip(zone)
            .map(|(id, zone)| format!("aws:///{zone}/{id}")),
        name: child_text(instance, "privateDnsName"),
        role_source: tags.get(ROLE_TAG).cloned().map(RoleSource::Tag),
        private_ips: child_text(instance, "privateIpAddress").into_iter().collect(),
        public_ips: child_text(instance, "ipAddress").into_iter().collect(),
        ssh_keys: BTreeMap::new(),
    }
}

/// Records of one `DescribeInstances` page and its continuation token.
fn parse_describe_instances(
    body: &str,
) -> Result<(Vec<InstanceRecord>, Option<String>), LookupError> {
    let root = Element::parse(body.as_bytes())
        .map_err(|err| LookupError::permanent("parsing DescribeInstances", err))?;
    let records = items(&root, "reservationSet")
        .flat_map(|reservation| items(reservation, "instancesSet"))
        .map(convert_instance)
        .collect();
    Ok((records, child_text(&root, "nextToken")))
}

pub struct AwsApi {
    client: reqwest::Client,
}

impl AwsApi {
    pub fn new() -> anyhow::Result<Self> {
        Ok(AwsApi {
            client: http::client()?,
        })
    }

    async fn imds_token(&self) -> Result<String, LookupError> {
        http::required(
            self.client
                .put(format!("{IMDS_URL}/api/token"))
                .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS)
                .timeout(METADATA_TIMEOUT),
            "IMDSv2 session token",
        )
        .await
    }

    async fn imds(&self, path: &str) -> Result<String, LookupError> {
        let token = self.imds_token().await?;
        http::required(
            self.client
                .get(format!("{IMDS_URL}/{path}"))
                .header("X-aws-ec2-metadata-token", token)
                .timeout(METADATA_TIMEOUT),
            path,
        )
        .await
    }

    async fn tag(&self, key: &str) -> Result<String, LookupError> {
        self.imds(&format!("meta-data/tags/instance/{key}")).await
    }

    async fn identity_document(&self) -> Result<IdentityDocument, LookupError> {
        let document = self.imds("dynamic/instance-identity/document").await?;
        serde_json::from_str(&document)
            .map_err(|err| LookupError::permanent("parsing the instance identity document", err))
    }

    async fn credentials(&self) -> Result<RoleCredentials, LookupError> {
        let roles = self.imds("meta-data/iam/security-credentials/").await?;
        let role = roles
            .lines()
            .next()
            .ok_or_else(|| LookupError::MissingMetadata("instance profile".to_string()))?;
        let credentials = self
            .imds(&format!("meta-data/iam/security-credentials/{role}"))
            .await?;
        serde_json::from_str(&credentials)
            .map_err(|err| LookupError::permanent("parsing instance profile credentials", err))
    }
}

#[async_trait]
impl CloudApi for AwsApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    async fn provider_id(&self) -> Result<String, LookupError> {
        let zone = self.imds("meta-data/placement/availability-zone").await?;
        let id = self.imds("meta-data/instance-id").await?;
        Ok(format!("aws:///{zone}/{id}"))
    }

    async fn name(&self) -> Result<String, LookupError> {
        self.imds("meta-data/local-hostname").await
    }

    async fn project_id(&self) -> Result<String, LookupError> {
        Ok(self.identity_document().await?.account_id)
    }

    async fn uid(&self) -> Result<String, LookupError> {
        self.tag(UID_TAG).await
    }

    async fn vpc_ip(&self) -> Result<String, LookupError> {
        self.imds("meta-data/local-ipv4").await
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        self.tag(INIT_SECRET_HASH_TAG).await
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        Ok(RoleSource::Tag(self.tag(ROLE_TAG).await?))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        let uid = self.uid().await?;
        let region = self.identity_document().await?.region;
        let credentials = self.credentials().await?;
        let host = format!("ec2.{region}.amazonaws.com");

        let mut records = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut params: Vec<(String, String)> = vec![
                ("Action".to_string(), "DescribeInstances".to_string()),
                ("Version".to_string(), EC2_API_VERSION.to_string()),
                ("Filter.1.Name".to_string(), format!("tag:{UID_TAG}")),
                ("Filter.1.Value.1".to_string(), uid.clone()),
                ("Filter.2.Name".to_string(), "instance-state-name".to_string()),
                ("Filter.2.Value.1".to_string(), "running".to_string()),
            ];
            if let Some(token) = &next_token {
                params.push(("NextToken".to_string(), token.clone()));
            }
            let query = canonical_query(&params);

            let mut request = self
                .client
                .get(format!("https://{host}/?{query}"))
                .timeout(CONTROL_PLANE_TIMEOUT);
            for (name, value) in sign_get(&credentials, &region, "ec2", &host, &query, Utc::now()) {
                request = request.header(name, value);
            }
            let body = http::text(request, "DescribeInstances").await?;
            let (page, token) = parse_describe_instances(&body)?;
            debug!("DescribeInstances page with {} instances", page.len());
            records.extend(page);
            match token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const DESCRIBE_INSTANCES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>8f7724cf-496f-496e-8fe3-example</requestId>
    <reservationSet>
        <item>
            <instancesSet>
                <item>
                    <instanceId>i-1234567890abcdef0</instanceId>
                    <placement><availabilityZone>eu-central-1a</availabilityZone></placement>
                    <privateDnsName>ip-10-0-1-4.eu-central-1.compute.internal</privateDnsName>
                    <privateIpAddress>10.0.1.4</privateIpAddress>
                    <ipAddress>3.120.0.1</ipAddress>
                    <tagSet>
                        <item><key>constellation-role</key><value>control-plane</value></item>
                        <item><key>constellation-uid</key><value>uid1</value></item>
                    </tagSet>
                </item>
                <item>
                    <privateIpAddress>10.0.1.5</privateIpAddress>
                </item>
            </instancesSet>
        </item>
    </reservationSet>
    <nextToken>page2</nextToken>
</DescribeInstancesResponse>"#;

    #[test]
    fn describe_instances_page() -> anyhow::Result<()> {
        let (records, token) = parse_describe_instances(DESCRIBE_INSTANCES)?;
        assert_eq!(token.as_deref(), Some("page2"));
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].provider_id.as_deref(),
            Some("aws:///eu-central-1a/i-1234567890abcdef0")
        );
        assert_eq!(
            records[0].role_source,
            Some(RoleSource::Tag("control-plane".to_string()))
        );
        assert_eq!(records[0].public_ips, vec!["3.120.0.1".to_string()]);
        assert_eq!(records[1].provider_id, None);
        Ok(())
    }

    #[test]
    fn garbage_is_a_permanent_error() {
        assert!(parse_describe_instances("<not xml").is_err_and(|err| !err.is_transient()));
    }

    #[test]
    fn query_is_sorted_and_encoded() {
        let params = [
            ("Version".to_string(), "2016-11-15".to_string()),
            ("Filter.1.Value.1".to_string(), "a b/c".to_string()),
            ("Action".to_string(), "DescribeInstances".to_string()),
        ];
        assert_eq!(
            canonical_query(&params),
            "Action=DescribeInstances&Filter.1.Value.1=a%20b%2Fc&Version=2016-11-15"
        );
    }

    #[test]
    fn signed_headers() {
        let credentials = RoleCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            token: Some("session".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let headers = sign_get(
            &credentials,
            "us-east-1",
            "ec2",
            "ec2.us-east-1.amazonaws.com",
            "Action=DescribeInstances",
            now,
        );
        let names: Vec<&str> = headers.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["x-amz-date", "x-amz-security-token", "authorization"]);
        assert_eq!(headers[0].1, "20150830T123600Z");

        let authorization = &headers[2].1;
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/ec2/aws4_request, SignedHeaders=host;x-amz-date;x-amz-security-token, Signature="
        ));
        let signature = authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        let again = sign_get(
            &credentials,
            "us-east-1",
            "ec2",
            "ec2.us-east-1.amazonaws.com",
            "Action=DescribeInstances",
            now,
        );
        assert_eq!(headers, again);
    }
}
