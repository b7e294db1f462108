diesel::table! {
    orders (id) {
        id -> Uuid,
        items -> Jsonb,
        total -> Int8,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
