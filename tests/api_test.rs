#[cfg(test)]
mod api_integration_tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use nextier::core::shared::test_utils::{test_state, TestAppStateBuilder};
    use nextier::main_module::build_router;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEAM: &str = "5b0c1f3e-9a7d-4c2e-8f61-2d4b7e9a1c30";

    fn app() -> Router {
        build_router(test_state())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-team-id", TEAM)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-team-id", TEAM)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn liveness_probe_is_ok() {
        let (status, body) = send(app(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "nextier");
    }

    #[tokio::test]
    async fn readiness_reports_database_down() {
        let (status, body) =
            send(app(), Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["database"], false);
        assert_eq!(body["providers"]["stripe"], false);
        assert_eq!(body["providers"]["llm"], Value::Null);
    }

    #[tokio::test]
    async fn team_header_is_required() {
        let request = Request::get("/api/sms/queue/stats").body(Body::empty()).unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "missing x-team-id header");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn malformed_team_id_is_rejected() {
        let request = Request::get("/api/sms/queue/stats")
            .header("x-team-id", "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn bearer_token_is_enforced_when_configured() {
        let state = TestAppStateBuilder::new().with_api_token("s3cret").build();

        let (status, _) = send(build_router(state.clone()), get("/api/sms/queue/stats")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::get("/api/sms/queue/stats")
            .header("x-team-id", TEAM)
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(build_router(state.clone()), wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "invalid bearer token");

        let right = Request::get("/api/sms/queue/stats")
            .header("x-team-id", TEAM)
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(build_router(state), right).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_queue_stats_are_zero() {
        let (status, body) = send(app(), get("/api/sms/queue/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        for key in ["draft", "approved", "pending", "sent", "failed", "opted_out_numbers"] {
            assert_eq!(body["data"][key], 0, "{key}");
        }
    }

    #[tokio::test]
    async fn segments_count_without_a_team() {
        let request = Request::post("/api/sms/segments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "text": "Hi Maria, still roofing in Austin?" }).to_string()))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["segments"], 1);
    }

    #[tokio::test]
    async fn unconfigured_providers_answer_503() {
        let cases = [
            post_json("/api/billing/checkout", json!({ "plan_id": "pro" })),
            post_json("/api/ai/chat", json!({ "messages": [{ "role": "user", "content": "hi" }] })),
            post_json("/api/enrichment/person", json!({ "email": "maria@ruiz.com" })),
            post_json("/api/property/search", json!({ "city": "Austin" })),
        ];
        for request in cases {
            let uri = request.uri().to_string();
            let (status, body) = send(app(), request).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert_eq!(body["success"], false, "{uri}");
        }
    }

    #[tokio::test]
    async fn stripe_webhook_needs_a_secret() {
        let request = Request::post("/api/webhooks/stripe")
            .header("stripe-signature", "t=1,v1=00")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(app(), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn bucket_upload_without_storage_is_503() {
        let boundary = "nextier-boundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"leads.csv\"\r\n\
             Content-Type: text/csv\r\n\r\nphone\r\n5125550101\r\n--{boundary}--\r\n"
        );
        let request = Request::post(format!("/api/buckets/{}/upload", Uuid::new_v4()))
            .header("x-team-id", TEAM)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "object storage is not configured");
    }

    #[tokio::test]
    async fn remix_falls_back_to_local_copy() {
        let request = post_json(
            "/api/ai/sms/remix",
            json!({ "message": "Hey Maria, quick question about your roofing jobs in Austin." }),
        );
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["source"], "local");
        assert!(body["data"]["characters"].as_u64().unwrap() <= 160);
    }

    #[tokio::test]
    async fn blank_remix_is_a_bad_request() {
        let (status, body) = send(app(), post_json("/api/ai/sms/remix", json!({ "message": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "message is required");
    }

    #[tokio::test]
    async fn gianna_defaults_to_human_in_loop() {
        let (status, body) = send(app(), get("/api/gianna/settings")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["mode"], "human_in_loop");
    }

    #[tokio::test]
    async fn database_outage_surfaces_as_500_envelope() {
        let (status, body) = send(app(), get("/api/buckets")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("database error"));
    }

    #[tokio::test]
    async fn sector_stats_read_as_zeros_without_a_database() {
        let (status, body) = send(app(), get("/api/sectors/construction-contractors/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["sector"], "construction-contractors");
        for key in ["new", "contacted", "qualified", "opted_out", "total"] {
            assert_eq!(body["data"][key], 0, "{key}");
        }
    }

    #[tokio::test]
    async fn inbound_stop_opts_out_even_when_the_database_is_down() {
        let state = test_state();
        let request = Request::post("/api/webhooks/sms/inbound")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "data": { "from": "+1 512 555 0199", "text": "STOP texting me, damn it" } })
                    .to_string(),
            ))
            .unwrap();
        let (status, body) = send(build_router(state.clone()), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        let (status, body) = send(build_router(state.clone()), get("/api/sms/opt-outs/5125550199")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["opted_out"], true);
        assert_eq!(body["data"]["origin"], "recipient");

        let delete = Request::delete("/api/sms/opt-outs/5125550199")
            .header("x-team-id", TEAM)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(build_router(state.clone()), delete).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn opt_outs_are_owned_by_the_recording_team() {
        let state = test_state();
        let (status, _) = send(
            build_router(state.clone()),
            post_json("/api/sms/opt-outs", json!({ "phone": "512-555-0142" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let other_team = Uuid::new_v4().to_string();
        let delete = |team: &str| {
            Request::delete("/api/sms/opt-outs/5125550142")
                .header("x-team-id", team)
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(build_router(state.clone()), delete(&other_team)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(state.sms_queue.is_opted_out("5125550142").await);

        let stats = Request::get("/api/sms/queue/stats")
            .header("x-team-id", other_team.as_str())
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(build_router(state.clone()), stats).await;
        assert_eq!(body["data"]["opted_out_numbers"], 0);

        let (status, body) = send(build_router(state.clone()), delete(TEAM)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["opted_out"], false);
    }

    #[tokio::test]
    async fn plan_catalogue_is_public() {
        let request = Request::get("/api/billing/plans").body(Body::empty()).unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["id"].as_str())
            .collect();
        assert_eq!(ids, ["starter", "pro", "agency"]);
    }
}
