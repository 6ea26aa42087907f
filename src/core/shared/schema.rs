diesel::table! {
    teams (id) {
        id -> Uuid,
        name -> Varchar,
        slug -> Varchar,
        owner_email -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    leads (id) {
        id -> Uuid,
        team_id -> Uuid,
        first_name -> Nullable<Varchar>,
        last_name -> Nullable<Varchar>,
        company -> Nullable<Varchar>,
        phone -> Nullable<Varchar>,
        email -> Nullable<Varchar>,
        address -> Nullable<Varchar>,
        city -> Nullable<Varchar>,
        state -> Nullable<Varchar>,
        zip -> Nullable<Varchar>,
        sic_code -> Nullable<Varchar>,
        sector -> Nullable<Varchar>,
        status -> Varchar,
        tags -> Array<Text>,
        priority_score -> Int4,
        source -> Nullable<Varchar>,
        bucket_id -> Nullable<Uuid>,
        notes -> Nullable<Text>,
        last_contacted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    campaigns (id) {
        id -> Uuid,
        team_id -> Uuid,
        name -> Varchar,
        status -> Varchar,
        channel -> Varchar,
        template -> Text,
        agent -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    campaign_leads (campaign_id, lead_id) {
        campaign_id -> Uuid,
        lead_id -> Uuid,
        team_id -> Uuid,
        status -> Varchar,
        enrolled_at -> Timestamptz,
    }
}

diesel::table! {
    sms_messages (id) {
        id -> Uuid,
        team_id -> Uuid,
        lead_id -> Nullable<Uuid>,
        campaign_id -> Nullable<Uuid>,
        direction -> Varchar,
        from_number -> Varchar,
        to_number -> Varchar,
        body -> Text,
        status -> Varchar,
        provider_message_id -> Nullable<Varchar>,
        classification -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    call_logs (id) {
        id -> Uuid,
        team_id -> Uuid,
        lead_id -> Nullable<Uuid>,
        call_sid -> Varchar,
        direction -> Varchar,
        from_number -> Varchar,
        to_number -> Varchar,
        status -> Varchar,
        duration_seconds -> Int4,
        disposition -> Nullable<Varchar>,
        notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    subscriptions (id) {
        id -> Uuid,
        team_id -> Uuid,
        plan_id -> Varchar,
        status -> Varchar,
        stripe_customer_id -> Nullable<Varchar>,
        stripe_subscription_id -> Nullable<Varchar>,
        current_period_end -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    lead_buckets (id) {
        id -> Uuid,
        team_id -> Uuid,
        name -> Varchar,
        description -> Nullable<Text>,
        source -> Nullable<Varchar>,
        lead_count -> Int4,
        storage_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    activity_events (id) {
        id -> Uuid,
        team_id -> Uuid,
        lead_id -> Nullable<Uuid>,
        kind -> Varchar,
        summary -> Text,
        payload -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    kv_store (key) {
        key -> Varchar,
        team_id -> Uuid,
        value -> Jsonb,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(leads -> teams (team_id));
diesel::joinable!(campaigns -> teams (team_id));
diesel::joinable!(campaign_leads -> campaigns (campaign_id));
diesel::joinable!(campaign_leads -> leads (lead_id));
diesel::joinable!(sms_messages -> leads (lead_id));
diesel::joinable!(call_logs -> leads (lead_id));

diesel::allow_tables_to_appear_in_same_query!(
    teams,
    leads,
    campaigns,
    campaign_leads,
    sms_messages,
    call_logs,
    subscriptions,
    lead_buckets,
    activity_events,
    kv_store,
);
