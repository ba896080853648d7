use serde_json::json;

use super::util::{check, parse_pairs, print_json};

fn client_request(method: reqwest::Method, url: String, admin_token: &str) -> reqwest::RequestBuilder {
    reqwest::Client::new().request(method, url).bearer_auth(admin_token)
}

pub async fn job_create(url: &str, admin_token: &str, job_type: String, pairs: Vec<String>) -> anyhow::Result<()> {
    let payload = parse_pairs(&pairs)?;
    let resp = client_request(reqwest::Method::POST, format!("{}/admin/jobs", url), admin_token)
        .json(&json!({ "type": job_type, "payload": payload }))
        .send()
        .await?;
    print_json(&check(resp).await?)
}

pub async fn job_get(url: &str, admin_token: &str, job_id: &str) -> anyhow::Result<()> {
    let resp = client_request(reqwest::Method::GET, format!("{}/admin/jobs/{}", url, job_id), admin_token)
        .send()
        .await?;
    print_json(&check(resp).await?)
}

pub async fn job_cancel(url: &str, admin_token: &str, job_id: &str) -> anyhow::Result<()> {
    let resp = client_request(reqwest::Method::POST, format!("{}/admin/jobs/{}/cancel", url, job_id), admin_token)
        .send()
        .await?;
    print_json(&check(resp).await?)
}
