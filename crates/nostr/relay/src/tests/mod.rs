mod filter_properties;
