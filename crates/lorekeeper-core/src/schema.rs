// Diesel table definitions for the two persistent stores described in
// the external-interfaces section: the relational mid-term memory table
// and the pgvector-backed long-term memory table.

diesel::table! {
    use diesel::sql_types::*;

    mid_term_memory (id) {
        id -> Uuid,
        bot_id -> Text,
        user_id -> Text,
        summary -> Text,
        keywords -> Text,
        raw_messages -> Jsonb,
        message_count -> Int4,
        start_time -> Timestamptz,
        end_time -> Timestamptz,
        access_count -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use pgvector::sql_types::Vector;

    memory_vectors (id) {
        id -> Uuid,
        bot_id -> Text,
        user_id -> Text,
        memory_type -> Text,
        content -> Text,
        embedding -> Vector,
        extra -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(mid_term_memory, memory_vectors,);
