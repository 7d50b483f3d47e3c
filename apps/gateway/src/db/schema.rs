// Read-only view of the tables owned by the room service.

diesel::table! {
    users (id) {
        id -> Text,
        username -> Text,
        display_name -> Text,
        avatar_url -> Nullable<Text>,
    }
}

diesel::table! {
    rooms (id) {
        id -> Text,
        name -> Text,
        owner_id -> Text,
        private -> Bool,
    }
}

diesel::joinable!(rooms -> users (owner_id));

diesel::allow_tables_to_appear_in_same_query!(rooms, users);
