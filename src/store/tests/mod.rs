mod helpers;
mod tests_query;
mod tests_vectors;
