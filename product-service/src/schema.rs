diesel::table! {
    products (id) {
        id -> Int8,
        seller_id -> Int8,
        name -> Varchar,
        description -> Text,
        price -> Numeric,
        category -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    product_availability (product_id) {
        product_id -> Int8,
        status -> Varchar,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(product_availability -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    product_availability,
);
