use diesel::table;

// Conversations are matches; rows reference them by `match_id`.
table! {
    messages (id) {
        id -> Text,
        match_id -> Text,
        sender_id -> Text,
        content -> Text,
        created_at -> Timestamptz,
    }
}
