diesel::table! {
    organizations (id) {
        id -> Uuid,
        name -> Text,
        slug -> Text,
        plan -> Text,
        usage_limit -> Int8,
        stripe_customer_id -> Nullable<Text>,
        stripe_subscription_id -> Nullable<Text>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        organization_id -> Nullable<Uuid>,
        role -> Text,
        email -> Text,
        full_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    usage_events (id) {
        id -> Uuid,
        organization_id -> Uuid,
        user_id -> Nullable<Uuid>,
        event_type -> Text,
        credits_used -> Int4,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_executions (id) {
        id -> Uuid,
        organization_id -> Uuid,
        workflow_name -> Text,
        status -> Text,
        input -> Nullable<Jsonb>,
        output -> Nullable<Jsonb>,
        error -> Nullable<Text>,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(users -> organizations (organization_id));
diesel::joinable!(usage_events -> organizations (organization_id));
diesel::joinable!(workflow_executions -> organizations (organization_id));

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    users,
    usage_events,
    workflow_executions,
);
