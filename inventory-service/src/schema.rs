diesel::table! {
    inventory (product_id) {
        product_id -> Int8,
        quantity -> Int8,
        reserved -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
