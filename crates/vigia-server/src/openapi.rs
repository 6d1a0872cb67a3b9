use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Vigia API",
        version = "0.3.0",
        description = "Control surface for the judicial portal monitoring service."
    ),
    paths(
        crate::routes::create_initial_job,
        crate::routes::create_priority_job,
        crate::routes::status,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateJobRequest,
        crate::dto::CreateJobResponse,
        crate::dto::HealthResponse,
        crate::dto::HealthChecks,
        crate::dto::StatusResponse,
        crate::dto::LaneStatus,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Manual scrape job submission"),
        (name = "system", description = "Health, metrics and queue status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Service secret. Set via VIGIA_SERVICE_SECRET environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
