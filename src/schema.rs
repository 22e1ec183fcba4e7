table! {
    download_token (token) {
        token -> Text,
        order_id -> Nullable<Text>,
        file_path -> Text,
        file_name -> Text,
        created_at -> Timestamp,
        expires_in_minutes -> BigInt,
        expires_at -> Timestamp,
        download_started -> Bool,
        started_at -> Nullable<Timestamp>,
        download_completed -> Bool,
        completed_at -> Nullable<Timestamp>,
    }
}
