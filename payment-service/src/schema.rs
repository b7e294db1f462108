diesel::table! {
    payments (id) {
        id -> Uuid,
        order_id -> Uuid,
        amount -> Int8,
        status -> Varchar,
        processed_at -> Timestamptz,
    }
}
