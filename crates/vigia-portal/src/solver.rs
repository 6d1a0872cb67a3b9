//! HTTP clients for the external CAPTCHA solver service.
//!
//! The service follows the create-task/poll-result shape common to
//! commercial solvers: `createTask` returns a task id, `getTaskResult` is
//! polled until the solution is ready.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use vigia_core::error::AppError;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const SOLVE_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<T: Serialize> {
    client_key: String,
    task: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum SolverTask {
    #[serde(rename = "ImageToTextTask")]
    ImageToText { body: String },
    #[serde(rename = "TurnstileTaskProxyless")]
    #[serde(rename_all = "camelCase")]
    Turnstile {
        website_url: String,
        website_key: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    error_id: i32,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultRequest {
    client_key: String,
    task_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    error_id: i32,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
}

#[derive(Deserialize)]
struct Solution {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Shared solver plumbing: one client, one API key, one base URL.
#[derive(Clone)]
pub struct SolverClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SolverClient {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::SolverApi {
                message: e.to_string(),
                status_code: 0,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Solve an image CAPTCHA; `image_base64` is the raw image content.
    pub async fn solve_image(&self, image_base64: &str) -> Result<String, AppError> {
        let solution = self
            .solve(SolverTask::ImageToText {
                body: image_base64.to_string(),
            })
            .await?;
        solution.text.ok_or_else(|| AppError::SolverApi {
            message: "solver returned no text".into(),
            status_code: 200,
        })
    }

    /// Solve a hosted challenge; returns the response token.
    pub async fn solve_challenge(
        &self,
        site_key: &str,
        page_url: &str,
    ) -> Result<String, AppError> {
        let solution = self
            .solve(SolverTask::Turnstile {
                website_url: page_url.to_string(),
                website_key: site_key.to_string(),
            })
            .await?;
        solution.token.ok_or_else(|| AppError::SolverApi {
            message: "solver returned no token".into(),
            status_code: 200,
        })
    }

    async fn solve(&self, task: SolverTask) -> Result<Solution, AppError> {
        let task_id = self.create_task(task).await?;
        let deadline = tokio::time::Instant::now() + SOLVE_DEADLINE;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if tokio::time::Instant::now() > deadline {
                return Err(AppError::SolverApi {
                    message: format!("task {task_id} not solved within deadline"),
                    status_code: 0,
                });
            }

            let result: TaskResultResponse = self
                .post(
                    "getTaskResult",
                    &TaskResultRequest {
                        client_key: self.api_key.clone(),
                        task_id,
                    },
                )
                .await?;

            if result.error_id != 0 {
                return Err(AppError::SolverApi {
                    message: result
                        .error_description
                        .unwrap_or_else(|| format!("solver error {}", result.error_id)),
                    status_code: 200,
                });
            }

            match result.status.as_deref() {
                Some("ready") => {
                    return result.solution.ok_or_else(|| AppError::SolverApi {
                        message: "ready result carried no solution".into(),
                        status_code: 200,
                    });
                }
                _ => continue,
            }
        }
    }

    async fn create_task(&self, task: SolverTask) -> Result<i64, AppError> {
        let response: CreateTaskResponse = self
            .post(
                "createTask",
                &CreateTaskRequest {
                    client_key: self.api_key.clone(),
                    task,
                },
            )
            .await?;

        if response.error_id != 0 {
            return Err(AppError::SolverApi {
                message: response
                    .error_description
                    .unwrap_or_else(|| format!("solver error {}", response.error_id)),
                status_code: 200,
            });
        }

        response.task_id.ok_or_else(|| AppError::SolverApi {
            message: "createTask returned no task id".into(),
            status_code: 200,
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &Req,
    ) -> Result<Resp, AppError> {
        let url = format!("{}/{endpoint}", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(30)
                } else {
                    AppError::SolverApi {
                        message: e.to_string(),
                        status_code: 0,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::SolverApi {
                message: format!("HTTP {}: {body}", status.as_u16()),
                status_code: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| AppError::SolverApi {
            message: format!("invalid solver response: {e}"),
            status_code: status.as_u16(),
        })
    }
}
