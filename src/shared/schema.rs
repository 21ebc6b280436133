diesel::table! {
    customers (id) {
        id -> Uuid,
        display_name -> Nullable<Text>,
        primary_email -> Nullable<Text>,
        first_contact -> Timestamptz,
        interaction_count -> Int4,
        sentiment_trend -> Jsonb,
        merged_into -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    customer_identifiers (id) {
        id -> Uuid,
        customer_id -> Uuid,
        kind -> Varchar,
        value -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    conversations (id) {
        id -> Uuid,
        customer_id -> Uuid,
        initial_channel -> Varchar,
        current_channel -> Varchar,
        status -> Varchar,
        sentiment -> Float8,
        search_attempts -> Int4,
        channel_switches -> Jsonb,
        started_at -> Timestamptz,
        last_activity_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    conversation_messages (id) {
        id -> Uuid,
        conversation_id -> Uuid,
        direction -> Varchar,
        role -> Varchar,
        channel -> Varchar,
        content -> Text,
        channel_message_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        conversation_id -> Uuid,
        customer_id -> Uuid,
        category -> Varchar,
        priority -> Varchar,
        status -> Varchar,
        escalation_reason -> Nullable<Varchar>,
        resolution_notes -> Nullable<Text>,
        created_at -> Timestamptz,
        resolved_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_events (event_key) {
        event_key -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    escalations (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        customer_id -> Uuid,
        reason -> Varchar,
        sentiment -> Float8,
        summary -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    dead_letters (id) {
        id -> Uuid,
        event_key -> Varchar,
        payload -> Jsonb,
        failure_reason -> Text,
        attempt_count -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(customer_identifiers -> customers (customer_id));
diesel::joinable!(conversations -> customers (customer_id));
diesel::joinable!(conversation_messages -> conversations (conversation_id));
diesel::joinable!(tickets -> conversations (conversation_id));

diesel::allow_tables_to_appear_in_same_query!(
    customers,
    customer_identifiers,
    conversations,
    conversation_messages,
    tickets,
    processed_events,
    escalations,
    dead_letters,
);
