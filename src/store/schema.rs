diesel::table! {
    store_items (key) {
        key -> Text,
        size -> BigInt,
        created_at -> BigInt,
        last_modified -> BigInt,
        last_accessed -> BigInt,
        access_count -> BigInt,
        priority -> Integer,
        expire_at -> Nullable<BigInt>,
        is_chunked -> Bool,
        total_chunks -> Nullable<Integer>,
        chunk_size -> Nullable<BigInt>,
        payload -> Nullable<Binary>,
    }
}

diesel::table! {
    store_chunks (item_key, seq) {
        item_key -> Text,
        seq -> Integer,
        data -> Binary,
    }
}

diesel::table! {
    store_meta (id) {
        id -> Integer,
        last_cleanup_at -> BigInt,
        version -> Integer,
    }
}

diesel::allow_tables_to_appear_in_same_query!(store_items, store_chunks);
